//! Wire-level tests for the REST client against a mock OCI endpoint.

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, header_exists, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::error::Error;
    use crate::oci::auth::RequestSigner;
    use crate::oci::client::*;
    use crate::oci::http::{Endpoints, OciHttpClient};
    use crate::oci::types::*;

    const TEST_KEY: &str = include_str!("../../tests/fixtures/test_api_key.pem");

    fn client(server: &MockServer) -> OciHttpClient {
        OciHttpClient::with_endpoints(Endpoints::with_base(&server.uri()), None).unwrap()
    }

    fn signed_client(server: &MockServer) -> OciHttpClient {
        let signer = RequestSigner::new("tenancy/user/fp".to_string(), TEST_KEY.as_bytes()).unwrap();
        OciHttpClient::with_endpoints(Endpoints::with_base(&server.uri()), Some(signer)).unwrap()
    }

    #[test]
    fn test_endpoints_for_region() {
        let e = Endpoints::for_region("us-ashburn-1");
        assert_eq!(e.load_balancer, "https://iaas.us-ashburn-1.oraclecloud.com/20170115");
        assert_eq!(e.core, "https://iaas.us-ashburn-1.oraclecloud.com/20160918");
        assert_eq!(
            e.file_storage,
            "https://filestorage.us-ashburn-1.oraclecloud.com/20171215"
        );
    }

    #[tokio::test]
    async fn test_get_load_balancer_is_signed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20170115/loadBalancers/lb1"))
            .and(header_exists("authorization"))
            .and(header_exists("date"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "lb1",
                "displayName": "kube-uid",
                "ipAddresses": [{"ipAddress": "203.0.113.7", "isPublic": true}],
                "listeners": {
                    "TCP-80": {
                        "name": "TCP-80",
                        "defaultBackendSetName": "TCP-80",
                        "port": 80,
                        "protocol": "TCP"
                    }
                },
                "lifecycleState": "ACTIVE"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let lb = signed_client(&server).get_load_balancer("lb1").await.unwrap();
        assert_eq!(lb.display_name, "kube-uid");
        assert_eq!(lb.ip_addresses[0].ip_address, "203.0.113.7");
        assert_eq!(lb.listeners["TCP-80"].port, 80);
    }

    #[tokio::test]
    async fn test_create_backend_set_returns_work_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/20170115/loadBalancers/lb1/backendSets"))
            .and(header_exists("x-content-sha256"))
            .and(body_partial_json(json!({"name": "TCP-80", "policy": "ROUND_ROBIN"})))
            .respond_with(ResponseTemplate::new(204).insert_header("opc-work-request-id", "wr-1"))
            .expect(1)
            .mount(&server)
            .await;

        let bs = BackendSet {
            name: "TCP-80".to_string(),
            policy: "ROUND_ROBIN".to_string(),
            backends: vec![],
            health_checker: HealthChecker {
                protocol: "HTTP".to_string(),
                url_path: Some("/healthz".to_string()),
                port: 10256,
            },
        };
        let wr = signed_client(&server).create_backend_set("lb1", &bs).await.unwrap();
        assert_eq!(wr, "wr-1");
    }

    #[tokio::test]
    async fn test_update_listener_omits_name() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/20170115/loadBalancers/lb1/listeners/TCP-443"))
            .respond_with(ResponseTemplate::new(204).insert_header("opc-work-request-id", "wr-2"))
            .mount(&server)
            .await;

        let listener = Listener {
            name: "TCP-443".to_string(),
            default_backend_set_name: "TCP-443".to_string(),
            port: 443,
            protocol: "TCP".to_string(),
            ssl_configuration: Some(SslConfiguration {
                certificate_name: "cert".to_string(),
                verify_depth: 0,
                verify_peer_certificate: false,
            }),
            connection_configuration: None,
        };
        client(&server).update_listener("lb1", &listener).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = requests[0].body_json().unwrap();
        assert!(body.get("name").is_none());
        assert_eq!(body["sslConfiguration"]["certificateName"], "cert");
        assert!(body.get("connectionConfiguration").is_none());
    }

    #[tokio::test]
    async fn test_error_body_is_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20160918/subnets/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({
                "code": "NotAuthorizedOrNotFound",
                "message": "subnet not found"
            })))
            .mount(&server)
            .await;

        let err = client(&server).get_subnet("missing").await.unwrap_err();
        assert!(err.is_not_found());
        match err {
            Error::CloudApi { status, code, message } => {
                assert_eq!(status, 404);
                assert_eq!(code, "NotAuthorizedOrNotFound");
                assert_eq!(message, "subnet not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_list_subnets_follows_pages_and_fills_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20160918/subnets"))
            .and(query_param("page", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "s2", "cidrBlock": "10.0.1.0/24"}
            ])))
            .with_priority(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/20160918/subnets"))
            .and(query_param("vcnId", "vcn1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("opc-next-page", "p2")
                    .set_body_json(json!([{"id": "s1", "cidrBlock": "10.0.0.0/24"}])),
            )
            .mount(&server)
            .await;

        let c = client(&server);
        let subnets = c.list_subnets("comp", "vcn1").await.unwrap();
        let ids: Vec<&str> = subnets.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["s1", "s2"]);

        let hit = c.get_subnet_from_cache_by_ip("10.0.1.9").await.unwrap();
        assert_eq!(hit.map(|s| s.id), Some("s2".to_string()));
        assert_eq!(c.subnet_cache().len(), 2);
    }

    #[tokio::test]
    async fn test_update_security_list_sends_if_match() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/20160918/securityLists/sl1"))
            .and(header("if-match", "etag-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "etag-2")
                    .set_body_json(json!({"id": "sl1", "ingressSecurityRules": []})),
            )
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/20160918/securityLists/sl1"))
            .and(header("if-match", "stale"))
            .respond_with(ResponseTemplate::new(412).set_body_json(json!({
                "code": "PreconditionFailed",
                "message": "etag mismatch"
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        let details = UpdateSecurityListDetails::default();
        let updated = c
            .update_security_list("sl1", Some("etag-1"), &details)
            .await
            .unwrap();
        assert_eq!(updated.etag.as_deref(), Some("etag-2"));

        let err = c
            .update_security_list("sl1", Some("stale"), &details)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_failed_work_request_surfaces_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20170115/loadBalancerWorkRequests/wr-9"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "wr-9",
                "lifecycleState": "FAILED",
                "message": "generic",
                "errorDetails": [{"errorCode": "BAD_INPUT", "message": "port in use"}]
            })))
            .mount(&server)
            .await;

        let err = client(&server).await_work_request("wr-9").await.unwrap_err();
        match err {
            Error::WorkRequestFailed { id, message } => {
                assert_eq!(id, "wr-9");
                assert_eq!(message, "port in use");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_load_balancer_by_name_skips_deleted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20170115/loadBalancers"))
            .and(query_param("displayName", "kube-uid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"id": "old", "displayName": "kube-uid", "lifecycleState": "DELETED"},
                {"id": "new", "displayName": "kube-uid", "lifecycleState": "ACTIVE"}
            ])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/20170115/loadBalancers"))
            .and(query_param("displayName", "absent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let c = client(&server);
        let lb = c.get_load_balancer_by_name("comp", "kube-uid").await.unwrap();
        assert_eq!(lb.id, "new");
        assert!(c
            .get_load_balancer_by_name("comp", "absent")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_create_volume_posts_source_details() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/20160918/volumes"))
            .and(body_partial_json(json!({
                "displayName": "pvc-uid",
                "sizeInMBs": 51200,
                "sourceDetails": {"type": "volumeBackup", "id": "ocid1.volumebackup.oc1..b"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "ocid1.volume.oc1..v",
                "displayName": "pvc-uid",
                "availabilityDomain": "AD-1",
                "sizeInMBs": 51200,
                "lifecycleState": "PROVISIONING"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let details = CreateVolumeDetails {
            availability_domain: "AD-1".to_string(),
            compartment_id: "comp".to_string(),
            display_name: "pvc-uid".to_string(),
            size_in_mbs: 51200,
            source_details: Some(VolumeSourceDetails::VolumeBackup {
                id: "ocid1.volumebackup.oc1..b".to_string(),
            }),
        };
        let vol = client(&server).create_volume(&details).await.unwrap();
        assert_eq!(vol.id, "ocid1.volume.oc1..v");
        assert_eq!(vol.lifecycle_state, "PROVISIONING");
    }

    #[tokio::test]
    async fn test_private_ip_lookup_by_address() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/20160918/privateIps"))
            .and(query_param("subnetId", "subnet1"))
            .and(query_param("ipAddress", "10.0.10.5"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{
                "id": "ocid1.privateip.a",
                "ipAddress": "10.0.10.5",
                "subnetId": "subnet1"
            }])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/20160918/privateIps"))
            .and(query_param("ipAddress", "10.0.10.6"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let c = client(&server);
        let ip = c
            .get_private_ip_by_address("subnet1", "10.0.10.5")
            .await
            .unwrap();
        assert_eq!(ip.id, "ocid1.privateip.a");

        let err = c
            .get_private_ip_by_address("subnet1", "10.0.10.6")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_route_table_replaces_rules() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/20160918/routeTables/rt1"))
            .and(body_partial_json(json!({
                "routeRules": [{
                    "destination": "10.244.1.0/24",
                    "destinationType": "CIDR_BLOCK",
                    "networkEntityId": "ocid1.privateip.a"
                }]
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "etag-2")
                    .set_body_json(json!({"id": "rt1", "routeRules": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let rules = [RouteRule {
            destination: "10.244.1.0/24".to_string(),
            destination_type: "CIDR_BLOCK".to_string(),
            network_entity_id: "ocid1.privateip.a".to_string(),
        }];
        let rt = client(&server)
            .update_route_table("rt1", None, &rules)
            .await
            .unwrap();
        assert_eq!(rt.etag.as_deref(), Some("etag-2"));
    }
}
