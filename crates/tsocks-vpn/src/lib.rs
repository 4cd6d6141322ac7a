//! TSocks VPN - Tunnel Control Plane
//!
//! Turns persisted settings into a tunnel interface, a per-app selection
//! policy and a proxy endpoint, then hands all three to an external
//! packet-forwarding engine.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                         VpnService                            │
//! │                                                               │
//! │  Settings ──┬──▶ ProxyEndpoint ─────────────────────┐         │
//! │             ├──▶ TunnelConfig ──▶ RouteSet ──┐      │         │
//! │             └──▶ AppSelectionPolicy ─────────┤      │         │
//! │                                              ▼      ▼         │
//! │                           InterfaceBuilder ──▶ TunHandle ──┐  │
//! │                                                            │  │
//! └────────────────────────────────────────────────────────────│──┘
//!                                                              │ fd
//!                                                              ▼
//!                                              ┌──────────────────────┐
//!                                              │  Forwarding Engine   │
//!                                              │  (ForwardingEngine)  │
//!                                              └──────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Fail-fast validation**: proxy and interface settings are checked
//!   before the platform is touched
//! - **Dual stack**: IPv4 and IPv6 configured independently
//! - **Self-exclusion**: the host application never enters its own tunnel
//! - **Route modes**: listed prefixes captured, or punched out of the
//!   default route
//! - **Single session**: one engine session per service, handle closed
//!   exactly once

mod apps;
mod config;
mod engine;
mod plan;
mod proxy;
mod route;
mod service;
mod settings;
mod tunnel;

#[cfg(test)]
mod testing;

pub use apps::{AppAction, AppInstruction, AppPolicyError, AppSelectionPolicy};
pub use config::{
    ConfigError, TunnelAddress, TunnelConfig, TUN_ADDRESS_V4, TUN_ADDRESS_V6, TUN_PREFIX_V4, TUN_PREFIX_V6,
};
pub use engine::{
    CancelFlag, EngineControl, EngineError, EngineLaunch, EngineSession, EngineStats, ForwardingEngine, LogEvent,
    LogSink, ENGINE_LOG_LEVEL,
};
pub use plan::{InterfacePlan, PlanSummary};
pub use proxy::{Credentials, ProxyEndpoint, ProxyProtocol, ProxyServer};
pub use route::{
    capture_routes, punch_routes, resolve_routes, AddressFamily, Families, RouteParseWarning, RouteSet, RouteSpec,
};
pub use service::{ServiceConfig, ServiceError, ServiceEvent, ServiceState, VpnPlatform, VpnService};
pub use settings::{
    AppFilterMode, ConfigFormat, FileSettings, MemorySettings, RouteMode, Settings, SettingsError, SettingsSource,
};
pub use tunnel::{
    establish, BuilderCall, CallLog, DryRunBuilder, Established, HandleCloser, InterfaceBuilder, InterfaceError,
    TunHandle,
};
