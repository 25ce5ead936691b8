//! Pagination direction.

use serde::{Deserialize, Serialize};

/// Direction of a pagination request relative to the timeline.
///
/// `Forwards` walks toward the live edge (now), `Backwards` toward room
/// creation. The merge persistor uses the direction to decide which page
/// token maps to which chunk edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Toward the most recent events.
    Forwards,
    /// Toward the oldest events.
    Backwards,
}

impl Direction {
    /// The opposite direction.
    pub fn reversed(self) -> Self {
        match self {
            Self::Forwards => Self::Backwards,
            Self::Backwards => Self::Forwards,
        }
    }

    /// Wire value used by the remote pagination API (`"f"` / `"b"`).
    pub fn as_wire(self) -> &'static str {
        match self {
            Self::Forwards => "f",
            Self::Backwards => "b",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_is_involutive() {
        assert_eq!(Direction::Forwards.reversed(), Direction::Backwards);
        assert_eq!(Direction::Backwards.reversed(), Direction::Forwards);
        assert_eq!(Direction::Forwards.reversed().reversed(), Direction::Forwards);
    }
}
