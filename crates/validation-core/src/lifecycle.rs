use crate::error::ValidationError;

/// Orchestration stages for one validation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStage {
    Received,
    Dispatched,
    Aggregated,
    Persisted,
    Published,
}

impl ValidationStage {
    pub fn name(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Dispatched => "dispatched",
            Self::Aggregated => "aggregated",
            Self::Persisted => "persisted",
            Self::Published => "published",
        }
    }
}

/// Enforces received->dispatched->aggregated->persisted->published ordering.
///
/// Stage state lives only here and in log lines; the sealed result is the
/// durable record. The machine is explicit so accidental skips (publishing
/// before persisting, most importantly) cannot happen silently.
#[derive(Debug, Clone)]
pub struct ValidationLifecycle {
    validation_id: String,
    stage: ValidationStage,
}

impl ValidationLifecycle {
    pub fn new(validation_id: impl Into<String>) -> Self {
        Self {
            validation_id: validation_id.into(),
            stage: ValidationStage::Received,
        }
    }

    pub fn validation_id(&self) -> &str {
        &self.validation_id
    }

    pub fn stage(&self) -> ValidationStage {
        self.stage
    }

    pub fn mark_dispatched(&mut self) -> Result<(), ValidationError> {
        self.advance(ValidationStage::Received, ValidationStage::Dispatched)
    }

    pub fn mark_aggregated(&mut self) -> Result<(), ValidationError> {
        self.advance(ValidationStage::Dispatched, ValidationStage::Aggregated)
    }

    pub fn mark_persisted(&mut self) -> Result<(), ValidationError> {
        self.advance(ValidationStage::Aggregated, ValidationStage::Persisted)
    }

    pub fn mark_published(&mut self) -> Result<(), ValidationError> {
        self.advance(ValidationStage::Persisted, ValidationStage::Published)
    }

    fn advance(
        &mut self,
        expected_current: ValidationStage,
        next: ValidationStage,
    ) -> Result<(), ValidationError> {
        if self.stage != expected_current {
            return Err(ValidationError::Lifecycle(format!(
                "stage order violation for validation '{}': expected '{}', got '{}'",
                self.validation_id,
                expected_current.name(),
                self.stage.name()
            )));
        }
        self.stage = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enforces_stage_order() {
        let mut lifecycle = ValidationLifecycle::new("val-1");
        assert!(lifecycle.mark_dispatched().is_ok());
        assert!(lifecycle.mark_aggregated().is_ok());
        assert!(lifecycle.mark_persisted().is_ok());
        assert!(lifecycle.mark_published().is_ok());
        assert_eq!(lifecycle.stage(), ValidationStage::Published);
    }

    #[test]
    fn rejects_publishing_before_persisting() {
        let mut lifecycle = ValidationLifecycle::new("val-2");
        lifecycle.mark_dispatched().unwrap();
        lifecycle.mark_aggregated().unwrap();

        let err = lifecycle.mark_published().unwrap_err();
        assert!(err
            .to_string()
            .contains("expected 'persisted', got 'aggregated'"));
    }
}
