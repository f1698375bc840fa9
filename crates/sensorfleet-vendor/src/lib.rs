//! Sensorfleet Vendor - concrete device strategies
//!
//! Each supported device family implements the auth and scrape contracts
//! from `sensorfleet-core`. `register_defaults` installs all of them in a
//! fixed order, which the credential prober searches first to last.

pub mod spindle;

use sensorfleet_core::{AuthRegistry, ScrapeRegistry};
use std::sync::Arc;

pub use spindle::{SpindleDevice, VendorError, SPINDLE_STRATEGY};

/// Register every built-in strategy
pub fn register_defaults(
    auth: &mut AuthRegistry,
    scrape: &mut ScrapeRegistry,
) -> Result<(), VendorError> {
    let spindle = Arc::new(SpindleDevice::new()?);
    auth.register(SPINDLE_STRATEGY, spindle.clone());
    scrape.register(SPINDLE_STRATEGY, spindle);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_defaults() {
        let mut auth = AuthRegistry::new();
        let mut scrape = ScrapeRegistry::new();
        register_defaults(&mut auth, &mut scrape).unwrap();
        assert_eq!(auth.names(), vec![SPINDLE_STRATEGY]);
        assert_eq!(scrape.names(), vec![SPINDLE_STRATEGY]);
    }
}
