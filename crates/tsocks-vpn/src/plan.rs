//! Interface Plan
//!
//! Everything one start attempt needs, resolved from a settings snapshot in
//! a single pass. Resolution is side-effect free, so an invalid setting is
//! reported before the platform is touched.

use crate::apps::{AppAction, AppInstruction, AppSelectionPolicy};
use crate::config::{ConfigError, TunnelConfig};
use crate::engine::EngineLaunch;
use crate::proxy::ProxyEndpoint;
use crate::route::{capture_routes, resolve_routes, RouteSet, RouteSpec};
use crate::settings::{AppFilterMode, RouteMode, Settings};
use serde::Serialize;
use std::net::IpAddr;
use tracing::{debug, warn};

/// Resolved configuration for one start attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePlan {
    pub tunnel: TunnelConfig,
    pub endpoint: ProxyEndpoint,
    /// Parsed route list, handed to the engine
    pub listed: RouteSet,
    /// Routes installed on the interface
    pub routes: Vec<RouteSpec>,
    pub apps: Vec<AppInstruction>,
    pub app_mode: AppFilterMode,
    pub own_package: String,
}

impl InterfacePlan {
    /// Resolve a plan, proxy first.
    ///
    /// Route warnings are logged and kept in `listed.warnings`.
    pub fn resolve(settings: &Settings, own_package: &str) -> Result<Self, ConfigError> {
        let endpoint = ProxyEndpoint::from_settings(settings)?;
        let tunnel = TunnelConfig::from_settings(settings)?;

        let listed = resolve_routes(&tunnel.route_list, tunnel.families);
        for warning in &listed.warnings {
            warn!("{}", warning);
        }
        let routes = capture_routes(&listed.routes, tunnel.families, tunnel.route_mode);

        let policy = AppSelectionPolicy::from_settings(settings, own_package);
        policy.validate()?;
        let apps = policy.instructions();

        debug!(
            "Resolved plan: {} via {}, {} routes, {} app instructions",
            tunnel.session_name,
            endpoint,
            routes.len(),
            apps.len()
        );

        Ok(Self {
            tunnel,
            endpoint,
            listed,
            routes,
            apps,
            app_mode: policy.mode(),
            own_package: own_package.to_string(),
        })
    }

    /// Engine start arguments for the established descriptor
    pub fn launch(&self, fd: i32) -> EngineLaunch {
        EngineLaunch::new(fd, &self.endpoint, &self.listed, self.tunnel.mtu)
    }

    /// Packages the interface will allow, in application order
    pub fn allowed_apps(&self) -> Vec<&str> {
        self.apps_with(AppAction::Allow)
    }

    /// Packages the interface will deny, own package last in Exclude mode
    pub fn disallowed_apps(&self) -> Vec<&str> {
        let mut denied: Vec<&str> = self
            .apps_with(AppAction::Deny)
            .into_iter()
            .filter(|p| *p != self.own_package)
            .collect();
        if self.app_mode == AppFilterMode::Exclude {
            denied.push(self.own_package.as_str());
        }
        denied
    }

    /// Packages kept off the tunnel by leaving them off the allow list
    pub fn omitted_apps(&self) -> Vec<&str> {
        match self.app_mode {
            AppFilterMode::Include => vec![self.own_package.as_str()],
            AppFilterMode::Exclude => Vec::new(),
        }
    }

    fn apps_with(&self, action: AppAction) -> Vec<&str> {
        self.apps
            .iter()
            .filter(|i| i.action == action)
            .map(|i| i.package.as_str())
            .collect()
    }

    /// Serializable view, credentials masked
    pub fn summary(&self) -> PlanSummary<'_> {
        PlanSummary {
            session: &self.tunnel.session_name,
            mtu: self.tunnel.mtu,
            addresses: self
                .tunnel
                .addresses
                .iter()
                .map(|a| format!("{}/{}", a.address, a.prefix_len))
                .collect(),
            dns_servers: &self.tunnel.dns_servers,
            route_mode: self.tunnel.route_mode,
            routes: &self.routes,
            listed_routes: &self.listed.routes,
            route_warnings: self.listed.warnings.iter().map(|w| w.to_string()).collect(),
            protocol: self.endpoint.protocol().name(),
            proxy: self.endpoint.to_string(),
            allowed_apps: self.allowed_apps(),
            disallowed_apps: self.disallowed_apps(),
            omitted_apps: self.omitted_apps(),
        }
    }
}

/// JSON-friendly plan description
#[derive(Debug, Serialize)]
pub struct PlanSummary<'a> {
    pub session: &'a str,
    pub mtu: u16,
    pub addresses: Vec<String>,
    pub dns_servers: &'a [IpAddr],
    pub route_mode: RouteMode,
    pub routes: &'a [RouteSpec],
    pub listed_routes: &'a [RouteSpec],
    pub route_warnings: Vec<String>,
    pub protocol: &'a str,
    pub proxy: String,
    pub allowed_apps: Vec<&'a str>,
    pub disallowed_apps: Vec<&'a str>,
    pub omitted_apps: Vec<&'a str>,
}
