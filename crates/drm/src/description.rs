use std::collections::HashMap;

use media_packet::SystemId;

/// DRM settings of a clip: which scheme, where to get licenses and which
/// extra headers to send with license requests.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DrmDescription {
    pub scheme: String,
    pub license_url: Option<String>,
    pub key_request_properties: HashMap<String, String>,
}

impl DrmDescription {
    pub fn new(scheme: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            ..Default::default()
        }
    }

    pub fn with_license_url(mut self, url: impl Into<String>) -> Self {
        self.license_url = Some(url.into());
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_request_properties.insert(key.into(), value.into());
        self
    }

    /// System id of a well-known scheme name.
    pub fn system_id(&self) -> Option<SystemId> {
        SystemId::from_scheme(&self.scheme)
    }

    /// Case-insensitive scheme comparison, also matching aliases such as
    /// `org.w3.clearkey` and `clearkey`.
    pub fn matches_scheme(&self, scheme: &str) -> bool {
        self.scheme.eq_ignore_ascii_case(scheme)
            || matches!(
                (self.system_id(), SystemId::from_scheme(scheme)),
                (Some(a), Some(b)) if a == b
            )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_matching() {
        let description = DrmDescription::new("org.w3.clearkey")
            .with_license_url("https://license.test/ck")
            .with_property("X-Token", "abc");
        assert!(description.matches_scheme("clearkey"));
        assert!(description.matches_scheme("ORG.W3.CLEARKEY"));
        assert!(!description.matches_scheme("widevine"));
        assert_eq!(description.system_id(), Some(SystemId::COMMON));
        assert_eq!(description.key_request_properties["X-Token"], "abc");
    }
}
