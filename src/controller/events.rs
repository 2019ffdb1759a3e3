//! Kubernetes Event emission

use chrono::Utc;
use k8s_openapi::api::core::v1::{Event, EventSource};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

/// Component name reported on every event.
pub const REPORTING_COMPONENT: &str = "oci-cloud-controller-manager";

/// Who is reporting, for the `source` and `reportingInstance` fields.
#[derive(Clone)]
pub struct EventReporter {
    client: Client,
    instance: String,
}

impl std::fmt::Debug for EventReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventReporter")
            .field("instance", &self.instance)
            .finish_non_exhaustive()
    }
}

impl EventReporter {
    pub fn new(client: Client, instance: impl Into<String>) -> Self {
        Self {
            client,
            instance: instance.into(),
        }
    }

    /// Record an event against `obj`. Failures are logged and swallowed.
    pub async fn publish<K>(&self, obj: &K, event_type: &str, reason: &str, message: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let now = Time(Utc::now());
        let event = Event {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}.", obj.name_any())),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            type_: Some(event_type.to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: obj.object_ref(&()),
            source: Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                host: Some(self.instance.clone()),
            }),
            reporting_component: Some(REPORTING_COMPONENT.to_string()),
            reporting_instance: Some(self.instance.clone()),
            first_timestamp: Some(now.clone()),
            last_timestamp: Some(now),
            count: Some(1),
            ..Default::default()
        };

        if let Err(e) = events.create(&PostParams::default(), &event).await {
            warn!("Failed to record {} event {:?}: {}", event_type, reason, e);
        }
    }
}
