use super::shopify::ShopifyConnector;
use super::stripe::StripeConnector;
use super::{Connector, ProviderKey};
use crate::error::Result;
use std::sync::OnceLock;

/// Static mapping from provider key to connector.
///
/// Each connector is constructed on first use and then shared by every
/// caller for the life of the registry.
#[derive(Debug, Default)]
pub struct ConnectorRegistry {
    stripe: OnceLock<StripeConnector>,
    shopify: OnceLock<ShopifyConnector>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds the Stripe connector, e.g. with a custom signature tolerance.
    pub fn with_stripe(self, connector: StripeConnector) -> Self {
        let _ = self.stripe.set(connector);
        self
    }

    pub fn resolve(&self, provider: ProviderKey) -> &dyn Connector {
        match provider {
            ProviderKey::Stripe => self.stripe.get_or_init(StripeConnector::new),
            ProviderKey::Shopify => self.shopify.get_or_init(ShopifyConnector::new),
        }
    }

    /// Resolves a provider key taken from a request path.
    pub fn resolve_str(&self, provider: &str) -> Result<&dyn Connector> {
        let key: ProviderKey = provider.parse()?;
        Ok(self.resolve(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PaymentError;

    #[test]
    fn test_resolve_returns_matching_connector() {
        let registry = ConnectorRegistry::new();
        for key in ProviderKey::ALL {
            assert_eq!(registry.resolve(key).provider(), key);
        }
    }

    #[test]
    fn test_resolve_is_lazy_and_shared() {
        let registry = ConnectorRegistry::new();
        assert!(registry.stripe.get().is_none());

        let a = registry.resolve(ProviderKey::Stripe) as *const dyn Connector as *const ();
        let b = registry.resolve(ProviderKey::Stripe) as *const dyn Connector as *const ();
        assert_eq!(a, b);
        assert!(registry.shopify.get().is_none());
    }

    #[test]
    fn test_resolve_unknown_provider() {
        let registry = ConnectorRegistry::new();
        assert!(matches!(
            registry.resolve_str("adyen"),
            Err(PaymentError::UnknownProvider(_))
        ));
    }
}
