//! Map loading seam.

use log::info;
use std::sync::{Mutex, PoisonError};

pub trait MapService: Send + Sync {
    fn change_map(&self, name: &str);

    fn current_map(&self) -> Option<String>;
}

/// Records the requested map and logs the change.
#[derive(Debug, Default)]
pub struct LoggingMapService {
    current: Mutex<Option<String>>,
}

impl LoggingMapService {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MapService for LoggingMapService {
    fn change_map(&self, name: &str) {
        info!("Changing map to {}", name);
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());
    }

    fn current_map(&self) -> Option<String> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_map() {
        let maps = LoggingMapService::new();
        assert_eq!(maps.current_map(), None);

        maps.change_map("docks");
        maps.change_map("harbor");
        assert_eq!(maps.current_map().as_deref(), Some("harbor"));
    }
}
