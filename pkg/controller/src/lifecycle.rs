use std::sync::atomic::{AtomicU8, Ordering};

/// Controller lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GatewayState {
    Starting,
    Running,
    ShuttingDown,
}

impl std::fmt::Display for GatewayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            GatewayState::Starting => "starting",
            GatewayState::Running => "running",
            GatewayState::ShuttingDown => "shutting-down",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct Lifecycle(AtomicU8);

impl Default for Lifecycle {
    fn default() -> Self {
        Self(AtomicU8::new(GatewayState::Starting as u8))
    }
}

impl Lifecycle {
    pub fn get(&self) -> GatewayState {
        match self.0.load(Ordering::Acquire) {
            0 => GatewayState::Starting,
            1 => GatewayState::Running,
            _ => GatewayState::ShuttingDown,
        }
    }

    /// Advance to `next`. Returns false if the state is already at or past it.
    pub fn advance(&self, next: GatewayState) -> bool {
        self.0.fetch_max(next as u8, Ordering::AcqRel) < next as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_moves_forward() {
        let l = Lifecycle::default();
        assert_eq!(l.get(), GatewayState::Starting);
        assert!(l.advance(GatewayState::Running));
        assert!(l.advance(GatewayState::ShuttingDown));
        assert!(!l.advance(GatewayState::Running));
        assert_eq!(l.get(), GatewayState::ShuttingDown);
    }
}
