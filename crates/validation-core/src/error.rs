use thiserror::Error;

/// Validation engine errors.
///
/// Rule rejection is never an error: it travels as a `FailedRule` value.
/// These variants cover infrastructure failures only.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("rule family '{family}' engine failed: {message}")]
    FamilyEngine { family: String, message: String },

    #[error("validation did not complete within {budget_ms}ms budget")]
    DispatchTimeout { budget_ms: u64 },

    #[error("validation dispatch cancelled: {0}")]
    DispatchCancelled(String),

    #[error("lifecycle violation: {0}")]
    Lifecycle(String),

    #[error("result store error: {0}")]
    Store(String),

    #[error("outcome publication failed after {attempts} attempts: {message}")]
    Publish { attempts: u32, message: String },

    #[error("rule configuration error for tenant '{tenant}': {message}")]
    Config { tenant: String, message: String },

    #[error("compliance hook '{hook}' failed: {message}")]
    Hook { hook: String, message: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ValidationError {
    pub fn family_engine(family: &str, message: impl Into<String>) -> Self {
        Self::FamilyEngine {
            family: family.to_string(),
            message: message.into(),
        }
    }

    pub fn hook(hook: &str, message: impl Into<String>) -> Self {
        Self::Hook {
            hook: hook.to_string(),
            message: message.into(),
        }
    }
}
