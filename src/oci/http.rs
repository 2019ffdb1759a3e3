//! REST implementation of the cloud client facade

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use super::auth::{RequestSigner, HTTP_DATE_FORMAT};
use super::cache::SubnetCache;
use super::client::*;
use super::poll::PollPolicy;
use super::types::*;
use crate::config::Config;
use crate::error::{Error, Result};

const WORK_REQUEST_HEADER: &str = "opc-work-request-id";
const NEXT_PAGE_HEADER: &str = "opc-next-page";
const USER_AGENT: &str = concat!("oci-ccm/", env!("CARGO_PKG_VERSION"));

/// Base URLs of the services the controller talks to, including API version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub load_balancer: String,
    pub core: String,
    pub file_storage: String,
    pub identity: String,
}

impl Endpoints {
    pub fn for_region(region: &str) -> Self {
        Self {
            load_balancer: format!("https://iaas.{region}.oraclecloud.com/20170115"),
            core: format!("https://iaas.{region}.oraclecloud.com/20160918"),
            file_storage: format!("https://filestorage.{region}.oraclecloud.com/20171215"),
            identity: format!("https://identity.{region}.oraclecloud.com/20160918"),
        }
    }

    /// Every service under one host, e.g. a local mock server.
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            load_balancer: format!("{base}/20170115"),
            core: format!("{base}/20160918"),
            file_storage: format!("{base}/20171215"),
            identity: format!("{base}/20160918"),
        }
    }
}

pub struct OciHttpClient {
    http: reqwest::Client,
    signer: Option<Arc<RequestSigner>>,
    endpoints: Endpoints,
    subnet_cache: SubnetCache,
    work_request_policy: PollPolicy,
}

impl OciHttpClient {
    pub fn new(cfg: &Config) -> Result<Self> {
        let signer = RequestSigner::from_config(&cfg.auth)?;
        Self::with_endpoints(Endpoints::for_region(&cfg.auth.region), Some(signer))
    }

    pub fn with_endpoints(endpoints: Endpoints, signer: Option<RequestSigner>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            http,
            signer: signer.map(Arc::new),
            endpoints,
            subnet_cache: SubnetCache::new(),
            work_request_policy: PollPolicy::work_request(),
        })
    }

    pub fn with_work_request_policy(mut self, policy: PollPolicy) -> Self {
        self.work_request_policy = policy;
        self
    }

    pub fn subnet_cache(&self) -> &SubnetCache {
        &self.subnet_cache
    }

    // ── request plumbing ──────────────────────────────────────────────────

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<Vec<u8>>,
        if_match: Option<&str>,
        resource: &'static str,
    ) -> Result<Response> {
        let mut request = self.http.request(method.clone(), url.clone());

        if let Some(signer) = &self.signer {
            let host = match (url.host_str(), url.port()) {
                (Some(h), Some(p)) => format!("{h}:{p}"),
                (Some(h), None) => h.to_string(),
                _ => return Err(Error::ConfigError(format!("URL without host: {url}"))),
            };
            let path_and_query = match url.query() {
                Some(q) => format!("{}?{}", url.path(), q),
                None => url.path().to_string(),
            };
            let date = Utc::now().format(HTTP_DATE_FORMAT).to_string();
            let signed = signer.sign(
                method.as_str(),
                &host,
                &path_and_query,
                body.as_deref(),
                &date,
            )?;
            for (name, value) in signed.headers {
                // reqwest derives these from the URL and body
                if name == "host" || name == "content-length" {
                    continue;
                }
                request = request.header(name, value);
            }
        } else if body.is_some() {
            request = request.header("content-type", "application/json");
        }

        if let Some(etag) = if_match {
            request = request.header("if-match", etag);
        }
        if let Some(body) = body {
            request = request.body(body);
        }

        debug!("{} {}", method, url);
        let result = request.send().await;
        let outcome = match &result {
            Ok(resp) if resp.status().is_success() => "success",
            _ => "error",
        };
        #[cfg(feature = "metrics")]
        crate::controller::metrics::record_cloud_request(resource, method.as_str(), outcome);
        #[cfg(not(feature = "metrics"))]
        let _ = (resource, outcome);

        let resp = result?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }

        let text = resp.text().await.unwrap_or_default();
        let parsed: ApiErrorBody = serde_json::from_str(&text).unwrap_or_default();
        let message = if parsed.message.is_empty() {
            text
        } else {
            parsed.message
        };
        warn!("{} {} failed with {}: {}", method, url, status, message);
        Err(Error::CloudApi {
            status: status.as_u16(),
            code: parsed.code,
            message,
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        resource: &'static str,
    ) -> Result<(T, HeaderMap)> {
        let resp = self.execute(Method::GET, url, None, None, resource).await?;
        let headers = resp.headers().clone();
        Ok((resp.json().await?, headers))
    }

    async fn send_json<B: Serialize + ?Sized>(
        &self,
        method: Method,
        url: Url,
        body: &B,
        if_match: Option<&str>,
        resource: &'static str,
    ) -> Result<Response> {
        let bytes = serde_json::to_vec(body)?;
        self.execute(method, url, Some(bytes), if_match, resource)
            .await
    }

    async fn list_all<T: DeserializeOwned>(
        &self,
        url: Url,
        resource: &'static str,
    ) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page: Option<String> = None;
        loop {
            let mut page_url = url.clone();
            if let Some(token) = &page {
                page_url.query_pairs_mut().append_pair("page", token);
            }
            let (batch, headers): (Vec<T>, HeaderMap) = self.get_json(page_url, resource).await?;
            items.extend(batch);
            page = header_value(&headers, NEXT_PAGE_HEADER);
            if page.is_none() {
                return Ok(items);
            }
        }
    }

    async fn mutate_lb(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        resource: &'static str,
    ) -> Result<String> {
        let resp = match body {
            Some(body) => self.send_json(method, url, &body, None, resource).await?,
            None => self.execute(method, url, None, None, resource).await?,
        };
        header_value(resp.headers(), WORK_REQUEST_HEADER).ok_or_else(|| Error::CloudApi {
            status: resp.status().as_u16(),
            code: "MissingWorkRequest".to_string(),
            message: format!("response to {resource} mutation carried no {WORK_REQUEST_HEADER}"),
        })
    }

    fn lb_url(&self, segments: &[&str]) -> Result<Url> {
        build_url(&self.endpoints.load_balancer, segments, &[])
    }

    fn core_url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        build_url(&self.endpoints.core, segments, query)
    }

    fn fss_url(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
        build_url(&self.endpoints.file_storage, segments, query)
    }
}

fn build_url(base: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url> {
    let mut url = Url::parse(base)
        .map_err(|e| Error::ConfigError(format!("invalid endpoint {base}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| Error::ConfigError(format!("endpoint {base} cannot be a base")))?
        .extend(segments);
    if !query.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (k, v) in query {
            pairs.append_pair(k, v);
        }
    }
    Ok(url)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn backend_set_body(bs: &BackendSet, with_name: bool) -> serde_json::Value {
    let mut body = json!({
        "policy": bs.policy,
        "backends": bs.backends,
        "healthChecker": bs.health_checker,
    });
    if with_name {
        body["name"] = json!(bs.name);
    }
    body
}

fn listener_body(listener: &Listener, with_name: bool) -> serde_json::Value {
    let mut body = json!({
        "defaultBackendSetName": listener.default_backend_set_name,
        "port": listener.port,
        "protocol": listener.protocol,
    });
    if let Some(ssl) = &listener.ssl_configuration {
        body["sslConfiguration"] = json!(ssl);
    }
    if let Some(conn) = &listener.connection_configuration {
        body["connectionConfiguration"] = json!(conn);
    }
    if with_name {
        body["name"] = json!(listener.name);
    }
    body
}

fn is_live(lifecycle_state: &str) -> bool {
    !matches!(lifecycle_state, "DELETING" | "DELETED" | "TERMINATING" | "TERMINATED")
}

#[async_trait]
impl LoadBalancerClient for OciHttpClient {
    async fn create_load_balancer(&self, details: &CreateLoadBalancerDetails) -> Result<String> {
        let url = self.lb_url(&["loadBalancers"])?;
        self.mutate_lb(Method::POST, url, Some(json!(details)), "load_balancer")
            .await
    }

    async fn get_load_balancer(&self, id: &str) -> Result<LoadBalancer> {
        let (lb, _) = self
            .get_json(self.lb_url(&["loadBalancers", id])?, "load_balancer")
            .await?;
        Ok(lb)
    }

    async fn get_load_balancer_by_name(
        &self,
        compartment_id: &str,
        display_name: &str,
    ) -> Result<LoadBalancer> {
        let url = build_url(
            &self.endpoints.load_balancer,
            &["loadBalancers"],
            &[("compartmentId", compartment_id), ("displayName", display_name)],
        )?;
        let mut matches: Vec<LoadBalancer> = self
            .list_all::<LoadBalancer>(url, "load_balancer")
            .await?
            .into_iter()
            .filter(|lb| lb.display_name == display_name && is_live(&lb.lifecycle_state))
            .collect();
        match matches.len() {
            0 => Err(Error::not_found(format!(
                "load balancer named {display_name}"
            ))),
            1 => Ok(matches.remove(0)),
            n => Err(Error::invariant(format!(
                "found {n} load balancers named {display_name}"
            ))),
        }
    }

    async fn delete_load_balancer(&self, id: &str) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", id])?;
        self.mutate_lb(Method::DELETE, url, None, "load_balancer").await
    }

    async fn create_backend_set(&self, lb_id: &str, backend_set: &BackendSet) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "backendSets"])?;
        let body = backend_set_body(backend_set, true);
        self.mutate_lb(Method::POST, url, Some(body), "backend_set").await
    }

    async fn update_backend_set(&self, lb_id: &str, backend_set: &BackendSet) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "backendSets", &backend_set.name])?;
        let body = backend_set_body(backend_set, false);
        self.mutate_lb(Method::PUT, url, Some(body), "backend_set").await
    }

    async fn delete_backend_set(&self, lb_id: &str, name: &str) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "backendSets", name])?;
        self.mutate_lb(Method::DELETE, url, None, "backend_set").await
    }

    async fn create_listener(&self, lb_id: &str, listener: &Listener) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "listeners"])?;
        let body = listener_body(listener, true);
        self.mutate_lb(Method::POST, url, Some(body), "listener").await
    }

    async fn update_listener(&self, lb_id: &str, listener: &Listener) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "listeners", &listener.name])?;
        let body = listener_body(listener, false);
        self.mutate_lb(Method::PUT, url, Some(body), "listener").await
    }

    async fn delete_listener(&self, lb_id: &str, name: &str) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "listeners", name])?;
        self.mutate_lb(Method::DELETE, url, None, "listener").await
    }

    async fn get_certificate_by_name(&self, lb_id: &str, name: &str) -> Result<Certificate> {
        let url = self.lb_url(&["loadBalancers", lb_id, "certificates"])?;
        let (certs, _): (Vec<Certificate>, _) = self.get_json(url, "certificate").await?;
        certs
            .into_iter()
            .find(|c| c.certificate_name == name)
            .ok_or_else(|| Error::not_found(format!("certificate {name} on {lb_id}")))
    }

    async fn create_certificate(
        &self,
        lb_id: &str,
        details: &CertificateDetails,
    ) -> Result<String> {
        let url = self.lb_url(&["loadBalancers", lb_id, "certificates"])?;
        self.mutate_lb(Method::POST, url, Some(json!(details)), "certificate")
            .await
    }

    async fn get_work_request(&self, id: &str) -> Result<WorkRequest> {
        let (wr, _) = self
            .get_json(self.lb_url(&["loadBalancerWorkRequests", id])?, "work_request")
            .await?;
        Ok(wr)
    }

    fn work_request_poll_policy(&self) -> PollPolicy {
        self.work_request_policy
    }
}

#[async_trait]
impl NetworkingClient for OciHttpClient {
    async fn get_subnet(&self, id: &str) -> Result<Subnet> {
        if let Some(subnet) = self.subnet_cache.get(id) {
            return Ok(subnet);
        }
        let (subnet, _): (Subnet, _) = self
            .get_json(self.core_url(&["subnets", id], &[])?, "subnet")
            .await?;
        self.subnet_cache.insert(subnet.clone());
        Ok(subnet)
    }

    async fn get_subnet_from_cache_by_ip(&self, ip: &str) -> Result<Option<Subnet>> {
        let addr = ip
            .parse()
            .map_err(|_| Error::validation(format!("invalid IP address {ip:?}")))?;
        Ok(self.subnet_cache.find_by_ip(addr))
    }

    async fn list_subnets(&self, compartment_id: &str, vcn_id: &str) -> Result<Vec<Subnet>> {
        let url = self.core_url(
            &["subnets"],
            &[("compartmentId", compartment_id), ("vcnId", vcn_id)],
        )?;
        let subnets: Vec<Subnet> = self.list_all(url, "subnet").await?;
        for subnet in &subnets {
            self.subnet_cache.insert(subnet.clone());
        }
        Ok(subnets)
    }

    async fn get_security_list(&self, id: &str) -> Result<SecurityList> {
        let (mut sl, headers): (SecurityList, _) = self
            .get_json(self.core_url(&["securityLists", id], &[])?, "security_list")
            .await?;
        sl.etag = header_value(&headers, "etag");
        Ok(sl)
    }

    async fn update_security_list(
        &self,
        id: &str,
        etag: Option<&str>,
        details: &UpdateSecurityListDetails,
    ) -> Result<SecurityList> {
        let url = self.core_url(&["securityLists", id], &[])?;
        let resp = self
            .send_json(Method::PUT, url, details, etag, "security_list")
            .await?;
        let new_etag = header_value(resp.headers(), "etag");
        let mut sl: SecurityList = resp.json().await?;
        sl.etag = new_etag;
        Ok(sl)
    }

    async fn get_private_ip(&self, id: &str) -> Result<PrivateIp> {
        let (ip, _) = self
            .get_json(self.core_url(&["privateIps", id], &[])?, "private_ip")
            .await?;
        Ok(ip)
    }

    async fn list_private_ips(&self, subnet_id: &str, ip_address: &str) -> Result<Vec<PrivateIp>> {
        let url = self.core_url(
            &["privateIps"],
            &[("subnetId", subnet_id), ("ipAddress", ip_address)],
        )?;
        self.list_all(url, "private_ip").await
    }

    async fn get_route_table(&self, id: &str) -> Result<RouteTable> {
        let (mut rt, headers): (RouteTable, _) = self
            .get_json(self.core_url(&["routeTables", id], &[])?, "route_table")
            .await?;
        rt.etag = header_value(&headers, "etag");
        Ok(rt)
    }

    async fn update_route_table(
        &self,
        id: &str,
        etag: Option<&str>,
        rules: &[RouteRule],
    ) -> Result<RouteTable> {
        let url = self.core_url(&["routeTables", id], &[])?;
        let body = json!({ "routeRules": rules });
        let resp = self
            .send_json(Method::PUT, url, &body, etag, "route_table")
            .await?;
        let new_etag = header_value(resp.headers(), "etag");
        let mut rt: RouteTable = resp.json().await?;
        rt.etag = new_etag;
        Ok(rt)
    }
}

#[async_trait]
impl ComputeClient for OciHttpClient {
    async fn get_instance(&self, id: &str) -> Result<Instance> {
        let (instance, _) = self
            .get_json(self.core_url(&["instances", id], &[])?, "instance")
            .await?;
        Ok(instance)
    }

    async fn list_instances(&self, compartment_id: &str) -> Result<Vec<Instance>> {
        let url = self.core_url(&["instances"], &[("compartmentId", compartment_id)])?;
        self.list_all(url, "instance").await
    }

    async fn list_vnic_attachments(
        &self,
        compartment_id: &str,
        instance_id: Option<&str>,
    ) -> Result<Vec<VnicAttachment>> {
        let mut query = vec![("compartmentId", compartment_id)];
        if let Some(id) = instance_id {
            query.push(("instanceId", id));
        }
        let url = self.core_url(&["vnicAttachments"], &query)?;
        self.list_all(url, "vnic_attachment").await
    }

    async fn get_instance_vnic(&self, vnic_id: &str) -> Result<Vnic> {
        let (vnic, _) = self
            .get_json(self.core_url(&["vnics", vnic_id], &[])?, "vnic")
            .await?;
        Ok(vnic)
    }
}

#[async_trait]
impl BlockStorageClient for OciHttpClient {
    async fn create_volume(&self, details: &CreateVolumeDetails) -> Result<Volume> {
        let url = self.core_url(&["volumes"], &[])?;
        let resp = self
            .send_json(Method::POST, url, details, None, "volume")
            .await?;
        Ok(resp.json().await?)
    }

    async fn get_volume(&self, id: &str) -> Result<Volume> {
        let (vol, _) = self
            .get_json(self.core_url(&["volumes", id], &[])?, "volume")
            .await?;
        Ok(vol)
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        let url = self.core_url(&["volumes", id], &[])?;
        self.execute(Method::DELETE, url, None, None, "volume")
            .await?;
        Ok(())
    }

    async fn get_volumes_by_name(&self, name: &str, compartment_id: &str) -> Result<Vec<Volume>> {
        let url = self.core_url(
            &["volumes"],
            &[("compartmentId", compartment_id), ("displayName", name)],
        )?;
        let volumes: Vec<Volume> = self.list_all(url, "volume").await?;
        Ok(volumes
            .into_iter()
            .filter(|v| v.display_name == name && is_live(&v.lifecycle_state))
            .collect())
    }
}

#[async_trait]
impl FileStorageClient for OciHttpClient {
    async fn create_file_system(&self, details: &CreateFileSystemDetails) -> Result<FileSystem> {
        let url = self.fss_url(&["fileSystems"], &[])?;
        let resp = self
            .send_json(Method::POST, url, details, None, "file_system")
            .await?;
        Ok(resp.json().await?)
    }

    async fn get_file_system(&self, id: &str) -> Result<FileSystem> {
        let (fs, _) = self
            .get_json(self.fss_url(&["fileSystems", id], &[])?, "file_system")
            .await?;
        Ok(fs)
    }

    async fn get_file_system_summary_by_display_name(
        &self,
        compartment_id: &str,
        availability_domain: &str,
        display_name: &str,
    ) -> Result<FileSystem> {
        let url = self.fss_url(
            &["fileSystems"],
            &[
                ("compartmentId", compartment_id),
                ("availabilityDomain", availability_domain),
                ("displayName", display_name),
            ],
        )?;
        let found: Vec<FileSystem> = self.list_all(url, "file_system").await?;
        let mut live: Vec<FileSystem> = found
            .into_iter()
            .filter(|fs| fs.display_name == display_name && is_live(&fs.lifecycle_state))
            .collect();
        match live.len() {
            0 => Err(Error::not_found(format!("file system named {display_name}"))),
            1 => Ok(live.remove(0)),
            n => Err(Error::invariant(format!(
                "found {n} file systems named {display_name}"
            ))),
        }
    }

    async fn delete_file_system(&self, id: &str) -> Result<()> {
        let url = self.fss_url(&["fileSystems", id], &[])?;
        self.execute(Method::DELETE, url, None, None, "file_system")
            .await?;
        Ok(())
    }

    async fn create_export(&self, details: &CreateExportDetails) -> Result<Export> {
        let url = self.fss_url(&["exports"], &[])?;
        let resp = self
            .send_json(Method::POST, url, details, None, "export")
            .await?;
        Ok(resp.json().await?)
    }

    async fn get_export(&self, id: &str) -> Result<Export> {
        let (export, _) = self
            .get_json(self.fss_url(&["exports", id], &[])?, "export")
            .await?;
        Ok(export)
    }

    async fn find_export(&self, file_system_id: &str, export_set_id: &str) -> Result<Export> {
        let url = self.fss_url(
            &["exports"],
            &[("fileSystemId", file_system_id), ("exportSetId", export_set_id)],
        )?;
        let exports: Vec<Export> = self.list_all(url, "export").await?;
        exports
            .into_iter()
            .find(|e| {
                e.file_system_id == file_system_id
                    && e.export_set_id == export_set_id
                    && is_live(&e.lifecycle_state)
            })
            .ok_or_else(|| Error::not_found(format!("export of {file_system_id}")))
    }

    async fn delete_export(&self, id: &str) -> Result<()> {
        let url = self.fss_url(&["exports", id], &[])?;
        self.execute(Method::DELETE, url, None, None, "export")
            .await?;
        Ok(())
    }

    async fn get_mount_target(&self, id: &str) -> Result<MountTarget> {
        let (mt, _) = self
            .get_json(self.fss_url(&["mountTargets", id], &[])?, "mount_target")
            .await?;
        Ok(mt)
    }
}

#[async_trait]
impl IdentityClient for OciHttpClient {
    async fn list_availability_domains(
        &self,
        compartment_id: &str,
    ) -> Result<Vec<AvailabilityDomain>> {
        let url = build_url(
            &self.endpoints.identity,
            &["availabilityDomains"],
            &[("compartmentId", compartment_id)],
        )?;
        let (ads, _) = self.get_json(url, "availability_domain").await?;
        Ok(ads)
    }
}
