use serde::{Deserialize, Serialize};

use crate::errors::DomainError;

/// Per-lead processing stages. Strictly sequential within one delivery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStage {
    Received,
    Matching,
    Assigned,
    Unassigned,
    Published,
    Done,
}

impl RoutingStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Matching => "matching",
            Self::Assigned => "assigned",
            Self::Unassigned => "unassigned",
            Self::Published => "published",
            Self::Done => "done",
        }
    }

    pub fn can_advance_to(&self, next: RoutingStage) -> bool {
        matches!(
            (self, next),
            (RoutingStage::Received, RoutingStage::Matching)
                // terminal record already present: republish or no-op
                | (RoutingStage::Received, RoutingStage::Published)
                | (RoutingStage::Received, RoutingStage::Done)
                | (RoutingStage::Matching, RoutingStage::Assigned)
                | (RoutingStage::Matching, RoutingStage::Unassigned)
                | (RoutingStage::Assigned, RoutingStage::Published)
                | (RoutingStage::Unassigned, RoutingStage::Published)
                // lost the insert race to another worker
                | (RoutingStage::Assigned, RoutingStage::Done)
                | (RoutingStage::Unassigned, RoutingStage::Done)
                | (RoutingStage::Published, RoutingStage::Done)
        )
    }
}

/// Ordered record of the stages one delivery went through.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTrail {
    stages: Vec<RoutingStage>,
}

impl Default for RoutingTrail {
    fn default() -> Self {
        Self { stages: vec![RoutingStage::Received] }
    }
}

impl RoutingTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> RoutingStage {
        self.stages.last().copied().unwrap_or(RoutingStage::Received)
    }

    pub fn stages(&self) -> &[RoutingStage] {
        &self.stages
    }

    pub fn advance(&mut self, next: RoutingStage) -> Result<(), DomainError> {
        let current = self.current();
        if !current.can_advance_to(next) {
            return Err(DomainError::InvalidRoutingTransition { from: current, to: next });
        }

        self.stages.push(next);
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.current() == RoutingStage::Done
    }
}

#[cfg(test)]
mod tests {
    use super::{RoutingStage, RoutingTrail};
    use crate::errors::DomainError;

    #[test]
    fn follows_happy_path_to_done() {
        let mut trail = RoutingTrail::new();
        for stage in [
            RoutingStage::Matching,
            RoutingStage::Assigned,
            RoutingStage::Published,
            RoutingStage::Done,
        ] {
            trail.advance(stage).expect("valid transition");
        }

        assert!(trail.is_done());
        assert_eq!(trail.stages().len(), 5);
    }

    #[test]
    fn duplicate_delivery_short_circuits_to_done() {
        let mut trail = RoutingTrail::new();
        trail.advance(RoutingStage::Done).expect("received -> done");
        assert_eq!(trail.stages(), &[RoutingStage::Received, RoutingStage::Done]);
    }

    #[test]
    fn cannot_publish_before_a_decision_is_recorded() {
        let mut trail = RoutingTrail::new();
        trail.advance(RoutingStage::Matching).expect("received -> matching");

        let error = trail.advance(RoutingStage::Published).expect_err("matching -> published");
        assert_eq!(
            error,
            DomainError::InvalidRoutingTransition {
                from: RoutingStage::Matching,
                to: RoutingStage::Published
            }
        );
        assert_eq!(trail.current(), RoutingStage::Matching);
    }

    #[test]
    fn done_is_final() {
        let mut trail = RoutingTrail::new();
        trail.advance(RoutingStage::Done).expect("received -> done");
        assert!(trail.advance(RoutingStage::Matching).is_err());
    }
}
