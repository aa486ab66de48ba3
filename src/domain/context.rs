use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// Who is performing a privileged write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Principal {
    /// A caller that presented the internal shared secret (worker, cron).
    Internal { component: String },
    /// An authenticated interactive operator.
    Operator { user_id: String },
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Internal { component } => write!(f, "internal:{component}"),
            Principal::Operator { user_id } => write!(f, "operator:{user_id}"),
        }
    }
}

/// Explicit token required by every port method that writes ledger or
/// anomaly state. It is minted only at an authentication boundary (the
/// internal secret check or [`Operator::context`]) and passed down by
/// value; stores record its principal on what they write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedContext {
    principal: Principal,
    issued_at: DateTime<Utc>,
}

impl TrustedContext {
    pub(crate) fn new(principal: Principal, issued_at: DateTime<Utc>) -> Self {
        Self {
            principal,
            issued_at,
        }
    }

    pub(crate) fn internal(component: impl Into<String>) -> Self {
        Self::new(
            Principal::Internal {
                component: component.into(),
            },
            Utc::now(),
        )
    }

    pub fn principal(&self) -> &Principal {
        &self.principal
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// An authenticated interactive user and the organizations the external
/// authorization decision lets them act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operator {
    pub user_id: String,
    pub org_ids: BTreeSet<String>,
}

impl Operator {
    pub fn new<I, S>(user_id: impl Into<String>, org_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: user_id.into(),
            org_ids: org_ids.into_iter().map(Into::into).collect(),
        }
    }

    pub fn can_access(&self, org_id: &str) -> bool {
        self.org_ids.contains(org_id)
    }

    pub fn context(&self, issued_at: DateTime<Utc>) -> TrustedContext {
        TrustedContext::new(
            Principal::Operator {
                user_id: self.user_id.clone(),
            },
            issued_at,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operator_access_and_context() {
        let operator = Operator::new("u_1", ["org_1", "org_2"]);
        assert!(operator.can_access("org_2"));
        assert!(!operator.can_access("org_3"));

        let ctx = operator.context(Utc::now());
        assert_eq!(ctx.principal().to_string(), "operator:u_1");
    }
}
