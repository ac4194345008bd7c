// appinapp-core/src/role.rs
use std::fmt;
use std::str::FromStr;

use crate::registry::{InstanceId, WIDGET_LABEL_PREFIX};

/// Label of the control-surface window.
pub const CONTROL_LABEL: &str = "control";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoleError {
    #[error("Unrecognised window label: '{0}'")]
    UnknownLabel(String),
    #[error("Widget window label has no instance id")]
    MissingInstanceId,
}

/// What a window process is, resolved once from its label at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessRole {
    ControlSurface,
    WidgetHost(InstanceId),
}

impl ProcessRole {
    pub fn from_label(label: &str) -> Result<Self, RoleError> {
        if label == CONTROL_LABEL {
            return Ok(ProcessRole::ControlSurface);
        }
        match label.strip_prefix(WIDGET_LABEL_PREFIX) {
            Some("") => Err(RoleError::MissingInstanceId),
            Some(id) => Ok(ProcessRole::WidgetHost(InstanceId::from(id))),
            None => Err(RoleError::UnknownLabel(label.to_string())),
        }
    }

    pub fn label(&self) -> String {
        match self {
            ProcessRole::ControlSurface => CONTROL_LABEL.to_string(),
            ProcessRole::WidgetHost(id) => format!("{WIDGET_LABEL_PREFIX}{id}"),
        }
    }
}

impl FromStr for ProcessRole {
    type Err = RoleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_label(s)
    }
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}
