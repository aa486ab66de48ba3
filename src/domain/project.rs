use crate::connectors::ProviderKey;
use serde::Deserialize;
use std::fmt;

/// Binds a public webhook key to the organization, project and provider it
/// receives events for, together with that project's signing secret.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct ProjectBinding {
    pub webhook_key: String,
    pub org_id: String,
    pub project_id: String,
    pub provider: ProviderKey,
    pub signing_secret: String,
}

impl fmt::Debug for ProjectBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectBinding")
            .field("webhook_key", &self.webhook_key)
            .field("org_id", &self.org_id)
            .field("project_id", &self.project_id)
            .field("provider", &self.provider)
            .field("signing_secret", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_redacts_secret() {
        let binding = ProjectBinding {
            webhook_key: "wh_1".into(),
            org_id: "org_1".into(),
            project_id: "proj_1".into(),
            provider: ProviderKey::Stripe,
            signing_secret: "whsec_supersecret".into(),
        };
        let rendered = format!("{binding:?}");
        assert!(!rendered.contains("supersecret"));
        assert!(rendered.contains("<redacted>"));
    }
}
