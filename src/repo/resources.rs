//! Resource identity and the registry of everything that has ever emitted
//! telemetry. A `Resource` is identified by `(service.name,
//! service.instance.id)`; each distinct non-identity attribute set observed
//! for it becomes a `ResourceView` shared by the records that carried it.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use opentelemetry_proto::tonic::resource::v1::Resource as OtlpResource;
use serde::Serialize;

use crate::config::TelemetryLimitOptions;
use crate::repo::attributes::{copy_attributes, stringify_any_value, KeyValuePair};

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";

const UNKNOWN_SERVICE: &str = "unknown";

/// Composite resource identity. Equality and hashing are ASCII
/// case-insensitive; `instance_id == None` doubles as a prefix selector
/// matching every instance of `name`.
#[derive(Debug, Clone, Eq, Serialize)]
pub struct ResourceKey {
    pub name: String,
    pub instance_id: Option<String>,
}

impl ResourceKey {
    pub fn new(name: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: Some(instance_id.into()),
        }
    }

    pub fn name_only(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instance_id: None,
        }
    }

    /// Canonical composite form, `"<name>-<instanceId>"`. `-` is the only
    /// separator; other separators never match on lookup.
    pub fn composite_name(&self) -> String {
        match &self.instance_id {
            Some(instance_id) => format!("{}-{}", self.name, instance_id),
            None => self.name.clone(),
        }
    }

    /// Selector match: `self` is the selector. A `None` instance id matches
    /// every instance of the name.
    pub fn matches(&self, candidate: &ResourceKey) -> bool {
        if !self.name.eq_ignore_ascii_case(&candidate.name) {
            return false;
        }
        match &self.instance_id {
            None => true,
            Some(selector_id) => candidate
                .instance_id
                .as_deref()
                .is_some_and(|id| selector_id.eq_ignore_ascii_case(id)),
        }
    }
}

impl PartialEq for ResourceKey {
    fn eq(&self, other: &Self) -> bool {
        if !self.name.eq_ignore_ascii_case(&other.name) {
            return false;
        }
        match (&self.instance_id, &other.instance_id) {
            (None, None) => true,
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => false,
        }
    }
}

impl Hash for ResourceKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for b in self.name.bytes() {
            state.write_u8(b.to_ascii_lowercase());
        }
        if let Some(id) = &self.instance_id {
            state.write_u8(b'-');
            for b in id.bytes() {
                state.write_u8(b.to_ascii_lowercase());
            }
        }
    }
}

/// Shared emitter identity. Concrete resources always carry an instance id;
/// uninstrumented peers never do.
#[derive(Debug, Serialize)]
pub struct Resource {
    pub key: ResourceKey,
    pub uninstrumented_peer: bool,
}

/// One observed attribute set of a resource, excluding the identity keys.
#[derive(Debug, Serialize)]
pub struct ResourceView {
    #[serde(skip)]
    pub resource: Arc<Resource>,
    pub attributes: Vec<KeyValuePair>,
    /// Key-sorted copy used for view identity comparison.
    #[serde(skip)]
    normalized: Vec<KeyValuePair>,
}

impl ResourceView {
    pub fn key(&self) -> &ResourceKey {
        &self.resource.key
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceSummary {
    pub key: ResourceKey,
    pub display_name: String,
    pub uninstrumented_peer: bool,
}

struct ResourceRecord {
    resource: Arc<Resource>,
    views: Vec<Arc<ResourceView>>,
}

#[derive(Default)]
pub struct ResourceRegistry {
    records: Vec<ResourceRecord>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves the view for an incoming OTLP resource, creating the
    /// resource and/or view on first observation. Returns the view and
    /// whether a new resource appeared (drives new-application
    /// notifications).
    pub fn get_or_create_view(
        &mut self,
        resource: Option<&OtlpResource>,
        options: &TelemetryLimitOptions,
    ) -> (Arc<ResourceView>, bool) {
        let raw = resource.map(|r| r.attributes.as_slice()).unwrap_or(&[]);
        let mut name = None;
        let mut instance_id = None;
        for kv in raw {
            match kv.key.as_str() {
                SERVICE_NAME => name = Some(stringify_any_value(kv.value.as_ref())),
                SERVICE_INSTANCE_ID => instance_id = Some(stringify_any_value(kv.value.as_ref())),
                _ => {}
            }
        }
        let name = name.filter(|n| !n.is_empty()).unwrap_or_else(|| UNKNOWN_SERVICE.to_string());
        // Resources without an instance id collapse to one instance per name.
        let instance_id = instance_id.filter(|i| !i.is_empty()).unwrap_or_else(|| name.clone());
        let key = ResourceKey::new(name, instance_id);

        let (record, created) = self.get_or_create_record(key, false);

        let identity_filter = |k: &str| k != SERVICE_NAME && k != SERVICE_INSTANCE_ID;
        let (attributes, _) = copy_attributes(raw, None, Some(&identity_filter), options);
        let mut normalized = attributes.clone();
        normalized.sort();

        if let Some(view) = record.views.iter().find(|v| v.normalized == normalized) {
            return (view.clone(), created);
        }
        let view = Arc::new(ResourceView {
            resource: record.resource.clone(),
            attributes,
            normalized,
        });
        record.views.push(view.clone());
        (view, created)
    }

    /// Resolves an uninstrumented-peer resource by name, creating it on
    /// first resolution.
    pub fn get_or_create_peer(&mut self, name: &str) -> (Arc<Resource>, bool) {
        let (record, created) = self.get_or_create_record(ResourceKey::name_only(name), true);
        (record.resource.clone(), created)
    }

    fn get_or_create_record(&mut self, key: ResourceKey, peer: bool) -> (&mut ResourceRecord, bool) {
        if let Some(idx) = self.records.iter().position(|r| r.resource.key == key) {
            return (&mut self.records[idx], false);
        }
        tracing::debug!(resource = %key.composite_name(), uninstrumented_peer = peer, "new resource");
        self.records.push(ResourceRecord {
            resource: Arc::new(Resource {
                key,
                uninstrumented_peer: peer,
            }),
            views: Vec::new(),
        });
        (self.records.last_mut().expect("just pushed"), true)
    }

    pub fn get_by_key(&self, key: &ResourceKey) -> Option<Arc<Resource>> {
        self.records
            .iter()
            .find(|r| r.resource.key == *key)
            .map(|r| r.resource.clone())
    }

    /// Case-insensitive lookup against the canonical composite form.
    pub fn get_by_composite_name(&self, composite_name: &str) -> Option<Arc<Resource>> {
        self.records
            .iter()
            .find(|r| r.resource.key.composite_name().eq_ignore_ascii_case(composite_name))
            .map(|r| r.resource.clone())
    }

    pub fn remove(&mut self, key: &ResourceKey) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.resource.key != *key);
        self.records.len() != before
    }

    /// Lists resources ordered by name (case-insensitive) then instance id,
    /// with display names shortened where unambiguous.
    pub fn summaries(&self, include_uninstrumented_peers: bool) -> Vec<ResourceSummary> {
        let mut resources: Vec<&Arc<Resource>> = self
            .records
            .iter()
            .map(|r| &r.resource)
            .filter(|r| include_uninstrumented_peers || !r.uninstrumented_peer)
            .collect();
        resources.sort_by(|a, b| {
            a.key
                .name
                .to_ascii_lowercase()
                .cmp(&b.key.name.to_ascii_lowercase())
                .then_with(|| a.key.instance_id.cmp(&b.key.instance_id))
        });

        resources
            .iter()
            .map(|resource| {
                let shared_name = resources
                    .iter()
                    .filter(|other| other.key.name.eq_ignore_ascii_case(&resource.key.name))
                    .count()
                    > 1;
                ResourceSummary {
                    key: resource.key.clone(),
                    display_name: display_name(&resource.key, shared_name),
                    uninstrumented_peer: resource.uninstrumented_peer,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A sole instance displays as the bare name. When instances share a name,
/// lowercase-UUID instance ids shorten to their first 8 hex characters.
fn display_name(key: &ResourceKey, shared_name: bool) -> String {
    let Some(instance_id) = &key.instance_id else {
        return key.name.clone();
    };
    if !shared_name {
        return key.name.clone();
    }
    if is_lowercase_uuid(instance_id) {
        format!("{}-{}", key.name, &instance_id[..8])
    } else {
        format!("{}-{}", key.name, instance_id)
    }
}

fn is_lowercase_uuid(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 36 {
        return false;
    }
    bytes.iter().enumerate().all(|(i, &c)| match i {
        8 | 13 | 18 | 23 => c == b'-',
        _ => c.is_ascii_digit() || (b'a'..=b'f').contains(&c),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};

    fn otlp_resource(pairs: &[(&str, &str)]) -> OtlpResource {
        OtlpResource {
            attributes: pairs
                .iter()
                .map(|(k, v)| KeyValue {
                    key: k.to_string(),
                    value: Some(AnyValue {
                        value: Some(any_value::Value::StringValue(v.to_string())),
                    }),
                })
                .collect(),
            ..Default::default()
        }
    }

    fn options() -> TelemetryLimitOptions {
        TelemetryLimitOptions::default()
    }

    #[test]
    fn composite_name_lookup_is_case_insensitive() {
        let mut registry = ResourceRegistry::new();
        let resource = otlp_resource(&[(SERVICE_NAME, "app2"), (SERVICE_INSTANCE_ID, "TestId")]);
        registry.get_or_create_view(Some(&resource), &options());

        assert!(registry.get_by_composite_name("APP2-testid").is_some());
        assert!(registry.get_by_composite_name("app2-TestId").is_some());
        // Only `-` separates the composite parts.
        assert!(registry.get_by_composite_name("APP2_TESTID").is_none());
    }

    #[test]
    fn distinct_attribute_sets_create_views_under_one_resource() {
        let mut registry = ResourceRegistry::new();
        let a = otlp_resource(&[(SERVICE_NAME, "app"), (SERVICE_INSTANCE_ID, "1"), ("env", "dev")]);
        let b = otlp_resource(&[("env", "dev"), (SERVICE_NAME, "app"), (SERVICE_INSTANCE_ID, "1")]);
        let c = otlp_resource(&[(SERVICE_NAME, "app"), (SERVICE_INSTANCE_ID, "1"), ("env", "prod")]);

        let (view_a, created_a) = registry.get_or_create_view(Some(&a), &options());
        let (view_b, created_b) = registry.get_or_create_view(Some(&b), &options());
        let (view_c, created_c) = registry.get_or_create_view(Some(&c), &options());

        assert!(created_a);
        assert!(!created_b);
        assert!(!created_c);
        // Same attribute set in a different order resolves to the same view.
        assert!(Arc::ptr_eq(&view_a, &view_b));
        assert!(!Arc::ptr_eq(&view_a, &view_c));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn uuid_instances_sharing_a_name_shorten_to_first_8_hex() {
        let mut registry = ResourceRegistry::new();
        let id1 = "59a617c8-89a9-4bc2-b8f1-b5ee33e30b03";
        let id2 = "32cb1d94-bcb1-4b46-a4cf-e376e6b23e68";
        for id in [id1, id2] {
            let resource = otlp_resource(&[(SERVICE_NAME, "app"), (SERVICE_INSTANCE_ID, id)]);
            registry.get_or_create_view(Some(&resource), &options());
        }

        let names: Vec<String> = registry
            .summaries(false)
            .into_iter()
            .map(|s| s.display_name)
            .collect();
        assert_eq!(names, vec!["app-32cb1d94", "app-59a617c8"]);
    }

    #[test]
    fn sole_instance_displays_as_bare_name() {
        let mut registry = ResourceRegistry::new();
        let resource = otlp_resource(&[(SERVICE_NAME, "solo"), (SERVICE_INSTANCE_ID, "abc")]);
        registry.get_or_create_view(Some(&resource), &options());

        let summaries = registry.summaries(false);
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].display_name, "solo");
    }

    #[test]
    fn non_uuid_instances_keep_the_full_id() {
        let mut registry = ResourceRegistry::new();
        for id in ["alpha", "beta"] {
            let resource = otlp_resource(&[(SERVICE_NAME, "app"), (SERVICE_INSTANCE_ID, id)]);
            registry.get_or_create_view(Some(&resource), &options());
        }
        let names: Vec<String> = registry
            .summaries(false)
            .into_iter()
            .map(|s| s.display_name)
            .collect();
        assert_eq!(names, vec!["app-alpha", "app-beta"]);
    }

    #[test]
    fn peers_are_hidden_unless_requested() {
        let mut registry = ResourceRegistry::new();
        let resource = otlp_resource(&[(SERVICE_NAME, "svc"), (SERVICE_INSTANCE_ID, "1")]);
        registry.get_or_create_view(Some(&resource), &options());
        let (peer, created) = registry.get_or_create_peer("redis");
        assert!(created);
        assert!(peer.uninstrumented_peer);
        assert!(peer.key.instance_id.is_none());

        assert_eq!(registry.summaries(false).len(), 1);
        assert_eq!(registry.summaries(true).len(), 2);
    }

    #[test]
    fn missing_identity_attributes_fall_back() {
        let mut registry = ResourceRegistry::new();
        let (view, _) = registry.get_or_create_view(None, &options());
        assert_eq!(view.key().name, "unknown");
        assert!(view.key().instance_id.is_some());
    }

    #[test]
    fn selector_with_no_instance_matches_all_instances() {
        let selector = ResourceKey::name_only("App");
        assert!(selector.matches(&ResourceKey::new("app", "1")));
        assert!(selector.matches(&ResourceKey::new("APP", "2")));
        assert!(!selector.matches(&ResourceKey::new("other", "1")));

        let exact = ResourceKey::new("app", "1");
        assert!(exact.matches(&ResourceKey::new("App", "1")));
        assert!(!exact.matches(&ResourceKey::new("app", "2")));
    }
}
