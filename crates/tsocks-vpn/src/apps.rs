//! Per-App Selection Policy
//!
//! Decides which installed applications send their traffic into the tunnel.
//!
//! | Mode | Selected set | Instructions |
//! |------|--------------|--------------|
//! | any | empty | none (every app is tunneled) |
//! | Include | `{a, b}` | allow `a`, allow `b` |
//! | Exclude | `{a, b}` | deny `a`, deny `b`, deny own package |
//!
//! The host application is never tunneled: in Include mode it is left off the
//! allow list, in Exclude mode it is always denied. The interface builder
//! additionally denies it as its last app-policy step.

use crate::config::ConfigError;
use crate::settings::{AppFilterMode, Settings};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use tracing::{debug, warn};

/// What to do with one application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppAction {
    /// Route the app through the tunnel
    Allow,
    /// Keep the app off the tunnel
    Deny,
}

impl fmt::Display for AppAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppAction::Allow => write!(f, "allow"),
            AppAction::Deny => write!(f, "deny"),
        }
    }
}

/// A single allow/deny instruction for the interface builder
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppInstruction {
    pub package: String,
    pub action: AppAction,
}

impl AppInstruction {
    pub fn allow(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            action: AppAction::Allow,
        }
    }

    pub fn deny(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            action: AppAction::Deny,
        }
    }
}

/// Selection mode plus the selected package set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppSelectionPolicy {
    mode: AppFilterMode,
    packages: BTreeSet<String>,
    own_package: String,
}

impl AppSelectionPolicy {
    pub fn new(mode: AppFilterMode, packages: BTreeSet<String>, own_package: impl Into<String>) -> Self {
        Self {
            mode,
            packages,
            own_package: own_package.into(),
        }
    }

    pub fn from_settings(settings: &Settings, own_package: &str) -> Self {
        Self::new(settings.app_filter_mode, settings.selected_apps.clone(), own_package)
    }

    pub fn mode(&self) -> AppFilterMode {
        self.mode
    }

    pub fn own_package(&self) -> &str {
        &self.own_package
    }

    /// Refuse an Include selection that allows nothing.
    ///
    /// A set holding only the own package or blank entries would leave the
    /// platform with no allow list, which tunnels every other app.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mode == AppFilterMode::Include && !self.packages.is_empty() && self.instructions().is_empty() {
            warn!("Include mode selects no app other than {}", self.own_package);
            return Err(ConfigError::NoAppsSelected);
        }
        Ok(())
    }

    /// Ordered instructions, selected packages in sorted order.
    ///
    /// Blank package identifiers are ignored.
    pub fn instructions(&self) -> Vec<AppInstruction> {
        let members = self
            .packages
            .iter()
            .map(|p| p.trim())
            .filter(|p| !p.is_empty());

        if self.packages.is_empty() {
            return Vec::new();
        }

        match self.mode {
            AppFilterMode::Include => members
                .filter(|p| {
                    let own = *p == self.own_package;
                    if own {
                        debug!("Leaving own package {} off the allow list", p);
                    }
                    !own
                })
                .map(AppInstruction::allow)
                .collect(),
            AppFilterMode::Exclude => {
                let mut out: Vec<AppInstruction> = members
                    .filter(|p| *p != self.own_package)
                    .map(AppInstruction::deny)
                    .collect();
                out.push(AppInstruction::deny(self.own_package.as_str()));
                out
            }
        }
    }
}

/// One per-app instruction the platform refused. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Failed to {action} app {package}: {reason}")]
pub struct AppPolicyError {
    pub package: String,
    pub action: AppAction,
    pub reason: String,
}

impl AppPolicyError {
    pub fn new(package: &str, action: AppAction, reason: impl Into<String>) -> Self {
        Self {
            package: package.to_string(),
            action,
            reason: reason.into(),
        }
    }
}
