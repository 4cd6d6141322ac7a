//! VPN Interface Builder
//!
//! Applies an [`InterfacePlan`] to the platform's interface builder and
//! returns the tunnel handle.
//!
//! # Order of operations
//!
//! 1. Session name, MTU, non-blocking mode
//! 2. Addresses, capture routes, DNS servers (enabled families only)
//! 3. Per-app allow/deny instructions
//! 4. Own package denied, always last
//! 5. Establish
//!
//! Per-app failures are collected and logged; anything else the platform
//! refuses aborts the attempt.

use crate::apps::{AppAction, AppPolicyError};
use crate::plan::InterfacePlan;
use crate::route::RouteSpec;
use serde::Serialize;
use std::fmt;
use std::io;
use std::net::IpAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

/// Platform interface builder.
///
/// One instance builds one interface; `establish` is called at most once.
pub trait InterfaceBuilder {
    fn set_session(&mut self, name: &str);

    fn set_mtu(&mut self, mtu: u16);

    fn set_blocking(&mut self, blocking: bool);

    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> Result<(), InterfaceError>;

    fn add_route(&mut self, route: &RouteSpec) -> Result<(), InterfaceError>;

    fn add_dns_server(&mut self, address: IpAddr) -> Result<(), InterfaceError>;

    fn add_allowed_application(&mut self, package: &str) -> Result<(), AppPolicyError>;

    fn add_disallowed_application(&mut self, package: &str) -> Result<(), AppPolicyError>;

    /// Create the interface and hand over its descriptor
    fn establish(&mut self) -> Result<TunHandle, InterfaceError>;
}

/// Releases a platform descriptor
pub trait HandleCloser: Send {
    fn close(&mut self, fd: i32) -> io::Result<()>;
}

/// Tunnel interface descriptor, closed exactly once.
///
/// Closing happens on [`TunHandle::close`] or on drop, whichever comes
/// first.
pub struct TunHandle {
    fd: i32,
    closer: Option<Box<dyn HandleCloser>>,
}

impl TunHandle {
    pub fn new(fd: i32, closer: impl HandleCloser + 'static) -> Self {
        Self {
            fd,
            closer: Some(Box::new(closer)),
        }
    }

    /// Take ownership of an open descriptor
    #[cfg(unix)]
    pub fn from_owned_fd(fd: std::os::fd::OwnedFd) -> Self {
        use std::os::fd::AsRawFd;

        let raw = fd.as_raw_fd();
        Self::new(raw, OwnedFdCloser(Some(fd)))
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn is_open(&self) -> bool {
        self.closer.is_some()
    }

    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(mut closer) = self.closer.take() {
            match closer.close(self.fd) {
                Ok(()) => debug!("Closed tunnel fd {}", self.fd),
                Err(e) => warn!("Failed to close tunnel fd {}: {}", self.fd, e),
            }
        }
    }
}

impl Drop for TunHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for TunHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunHandle")
            .field("fd", &self.fd)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(unix)]
struct OwnedFdCloser(Option<std::os::fd::OwnedFd>);

#[cfg(unix)]
impl HandleCloser for OwnedFdCloser {
    fn close(&mut self, _fd: i32) -> io::Result<()> {
        drop(self.0.take());
        Ok(())
    }
}

/// Interface errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterfaceError {
    #[error("interface establish failed: {0}")]
    EstablishFailed(String),

    #[error("platform rejected {what}: {reason}")]
    Rejected { what: String, reason: String },
}

/// Outcome of a successful [`establish`]
#[derive(Debug)]
pub struct Established {
    pub handle: TunHandle,
    /// Per-app instructions the platform refused
    pub app_errors: Vec<AppPolicyError>,
}

/// Build the interface described by `plan`
pub fn establish(plan: &InterfacePlan, builder: &mut dyn InterfaceBuilder) -> Result<Established, InterfaceError> {
    let tunnel = &plan.tunnel;

    builder.set_session(&tunnel.session_name);
    builder.set_mtu(tunnel.mtu);
    // The engine schedules its own reads and writes.
    builder.set_blocking(false);

    for address in &tunnel.addresses {
        builder.add_address(address.address, address.prefix_len)?;
    }
    for route in &plan.routes {
        builder.add_route(route)?;
    }
    for dns in &tunnel.dns_servers {
        builder.add_dns_server(*dns)?;
    }

    let mut app_errors = Vec::new();

    for instruction in plan.apps.iter().filter(|i| i.package != plan.own_package) {
        let result = match instruction.action {
            AppAction::Allow => builder.add_allowed_application(&instruction.package),
            AppAction::Deny => builder.add_disallowed_application(&instruction.package),
        };
        if let Err(e) = result {
            warn!("{}", e);
            app_errors.push(e);
        }
    }

    if let Err(e) = builder.add_disallowed_application(&plan.own_package) {
        warn!("{}", e);
        app_errors.push(e);
    }

    let handle = builder.establish()?;
    info!(
        "Interface `{}` established (fd {}, {} routes, {} app errors)",
        tunnel.session_name,
        handle.fd(),
        plan.routes.len(),
        app_errors.len()
    );

    Ok(Established { handle, app_errors })
}

/// One call recorded by [`DryRunBuilder`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum BuilderCall {
    SetSession { name: String },
    SetMtu { mtu: u16 },
    SetBlocking { blocking: bool },
    AddAddress { address: IpAddr, prefix_len: u8 },
    AddRoute { route: RouteSpec },
    AddDnsServer { address: IpAddr },
    AllowApp { package: String },
    DisallowApp { package: String },
    Establish { fd: i32 },
    Close { fd: i32 },
}

/// Shared view of the calls a [`DryRunBuilder`] recorded
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<BuilderCall>>>);

impl CallLog {
    fn push(&self, call: BuilderCall) {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).push(call);
    }

    pub fn snapshot(&self) -> Vec<BuilderCall> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn allowed_apps(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                BuilderCall::AllowApp { package } => Some(package),
                _ => None,
            })
            .collect()
    }

    pub fn disallowed_apps(&self) -> Vec<String> {
        self.snapshot()
            .into_iter()
            .filter_map(|c| match c {
                BuilderCall::DisallowApp { package } => Some(package),
                _ => None,
            })
            .collect()
    }

    pub fn establishes(&self) -> usize {
        self.count(|c| matches!(c, BuilderCall::Establish { .. }))
    }

    pub fn closes(&self) -> usize {
        self.count(|c| matches!(c, BuilderCall::Close { .. }))
    }

    fn count(&self, f: impl Fn(&BuilderCall) -> bool) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).iter().filter(|c| f(c)).count()
    }
}

struct RecordingCloser(CallLog);

impl HandleCloser for RecordingCloser {
    fn close(&mut self, fd: i32) -> io::Result<()> {
        self.0.push(BuilderCall::Close { fd });
        Ok(())
    }
}

/// Interface builder that records calls instead of touching the system.
///
/// Follows the platform rule that a session either allows or disallows
/// applications, never both.
#[derive(Debug, Default)]
pub struct DryRunBuilder {
    log: CallLog,
    fd: i32,
    refuse: Option<String>,
    rejected_packages: Vec<String>,
    app_action: Option<AppAction>,
}

impl DryRunBuilder {
    pub fn new() -> Self {
        Self {
            fd: -1,
            ..Self::default()
        }
    }

    /// Descriptor handed out by `establish`
    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = fd;
        self
    }

    /// Make `establish` fail with `reason`
    pub fn refuse_establish(mut self, reason: &str) -> Self {
        self.refuse = Some(reason.to_string());
        self
    }

    /// Treat `package` as not installed
    pub fn reject_package(mut self, package: &str) -> Self {
        self.rejected_packages.push(package.to_string());
        self
    }

    pub fn call_log(&self) -> CallLog {
        self.log.clone()
    }

    fn apply_app(&mut self, package: &str, action: AppAction) -> Result<(), AppPolicyError> {
        if self.rejected_packages.iter().any(|p| p == package) {
            return Err(AppPolicyError::new(package, action, "package not installed"));
        }
        match self.app_action {
            Some(existing) if existing != action => {
                return Err(AppPolicyError::new(
                    package,
                    action,
                    "cannot mix allowed and disallowed applications",
                ));
            }
            _ => self.app_action = Some(action),
        }

        self.log.push(match action {
            AppAction::Allow => BuilderCall::AllowApp {
                package: package.to_string(),
            },
            AppAction::Deny => BuilderCall::DisallowApp {
                package: package.to_string(),
            },
        });
        Ok(())
    }
}

impl InterfaceBuilder for DryRunBuilder {
    fn set_session(&mut self, name: &str) {
        self.log.push(BuilderCall::SetSession { name: name.to_string() });
    }

    fn set_mtu(&mut self, mtu: u16) {
        self.log.push(BuilderCall::SetMtu { mtu });
    }

    fn set_blocking(&mut self, blocking: bool) {
        self.log.push(BuilderCall::SetBlocking { blocking });
    }

    fn add_address(&mut self, address: IpAddr, prefix_len: u8) -> Result<(), InterfaceError> {
        self.log.push(BuilderCall::AddAddress { address, prefix_len });
        Ok(())
    }

    fn add_route(&mut self, route: &RouteSpec) -> Result<(), InterfaceError> {
        self.log.push(BuilderCall::AddRoute { route: *route });
        Ok(())
    }

    fn add_dns_server(&mut self, address: IpAddr) -> Result<(), InterfaceError> {
        self.log.push(BuilderCall::AddDnsServer { address });
        Ok(())
    }

    fn add_allowed_application(&mut self, package: &str) -> Result<(), AppPolicyError> {
        self.apply_app(package, AppAction::Allow)
    }

    fn add_disallowed_application(&mut self, package: &str) -> Result<(), AppPolicyError> {
        self.apply_app(package, AppAction::Deny)
    }

    fn establish(&mut self) -> Result<TunHandle, InterfaceError> {
        if let Some(reason) = &self.refuse {
            return Err(InterfaceError::EstablishFailed(reason.clone()));
        }
        self.log.push(BuilderCall::Establish { fd: self.fd });
        Ok(TunHandle::new(self.fd, RecordingCloser(self.log.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{AppFilterMode, Settings};

    fn plan(settings: &Settings) -> InterfacePlan {
        InterfacePlan::resolve(settings, "com.me").unwrap()
    }

    fn proxied() -> Settings {
        Settings {
            proxy_server: "127.0.0.1".to_string(),
            ..Settings::default()
        }
    }

    #[test]
    fn test_call_order() {
        let mut builder = DryRunBuilder::new().with_fd(7);
        let log = builder.call_log();

        let established = establish(&plan(&proxied()), &mut builder).unwrap();
        assert_eq!(established.handle.fd(), 7);
        assert!(established.app_errors.is_empty());

        assert_eq!(
            log.snapshot(),
            vec![
                BuilderCall::SetSession { name: "TSocks VPN".into() },
                BuilderCall::SetMtu { mtu: 1500 },
                BuilderCall::SetBlocking { blocking: false },
                BuilderCall::AddAddress {
                    address: "10.0.8.1".parse().unwrap(),
                    prefix_len: 24
                },
                BuilderCall::AddRoute { route: RouteSpec::new("0.0.0.0".parse().unwrap(), 0).unwrap() },
                BuilderCall::AddDnsServer { address: "8.8.8.8".parse().unwrap() },
                BuilderCall::DisallowApp { package: "com.me".into() },
                BuilderCall::Establish { fd: 7 },
            ]
        );
    }

    #[test]
    fn test_exclude_empty_set_denies_only_self() {
        let mut builder = DryRunBuilder::new();
        let log = builder.call_log();

        establish(&plan(&proxied()), &mut builder).unwrap();

        assert_eq!(log.disallowed_apps(), vec!["com.me"]);
        assert!(log.allowed_apps().is_empty());
    }

    #[test]
    fn test_own_package_denied_last_and_once() {
        let mut settings = proxied();
        settings.selected_apps = ["com.me", "com.a"].iter().map(|s| s.to_string()).collect();
        let mut builder = DryRunBuilder::new();
        let log = builder.call_log();

        establish(&plan(&settings), &mut builder).unwrap();

        assert_eq!(log.disallowed_apps(), vec!["com.a", "com.me"]);
    }

    #[test]
    fn test_include_mode_allow_list() {
        let mut settings = proxied();
        settings.app_filter_mode = AppFilterMode::Include;
        settings.selected_apps = ["com.b", "com.a"].iter().map(|s| s.to_string()).collect();
        let mut builder = DryRunBuilder::new();
        let log = builder.call_log();

        let established = establish(&plan(&settings), &mut builder).unwrap();

        assert_eq!(log.allowed_apps(), vec!["com.a", "com.b"]);
        assert!(log.disallowed_apps().is_empty());
        // Platform refuses to mix lists; the own package stays off by omission.
        assert_eq!(established.app_errors.len(), 1);
        assert_eq!(established.app_errors[0].package, "com.me");
    }

    #[test]
    fn test_app_failure_does_not_abort() {
        let mut settings = proxied();
        settings.selected_apps = ["com.a", "com.gone", "com.z"].iter().map(|s| s.to_string()).collect();
        let mut builder = DryRunBuilder::new().reject_package("com.gone");
        let log = builder.call_log();

        let established = establish(&plan(&settings), &mut builder).unwrap();

        assert_eq!(log.disallowed_apps(), vec!["com.a", "com.z", "com.me"]);
        assert_eq!(established.app_errors.len(), 1);
        assert_eq!(log.establishes(), 1);
    }

    #[test]
    fn test_dual_stack_per_family() {
        let mut settings = proxied();
        settings.ipv6_enabled = true;
        let mut builder = DryRunBuilder::new();
        let log = builder.call_log();

        establish(&plan(&settings), &mut builder).unwrap();

        let calls = log.snapshot();
        let addresses = calls.iter().filter(|c| matches!(c, BuilderCall::AddAddress { .. })).count();
        let routes: Vec<String> = calls
            .iter()
            .filter_map(|c| match c {
                BuilderCall::AddRoute { route } => Some(route.to_string()),
                _ => None,
            })
            .collect();

        assert_eq!(addresses, 2);
        assert_eq!(routes, vec!["0.0.0.0/0", "::/0"]);
    }

    #[test]
    fn test_establish_refused() {
        let mut builder = DryRunBuilder::new().refuse_establish("consent revoked");
        let log = builder.call_log();

        let err = establish(&plan(&proxied()), &mut builder).unwrap_err();

        assert_eq!(err, InterfaceError::EstablishFailed("consent revoked".into()));
        assert_eq!(log.establishes(), 0);
        assert_eq!(log.closes(), 0);
    }

    #[test]
    fn test_handle_closed_exactly_once() {
        let mut builder = DryRunBuilder::new().with_fd(9);
        let log = builder.call_log();

        let handle = builder.establish().unwrap();
        assert!(handle.is_open());
        handle.close();
        assert_eq!(log.closes(), 1);

        let handle = builder.establish().unwrap();
        drop(handle);
        assert_eq!(log.closes(), 2);
    }

    #[test]
    fn test_call_log_serializes() {
        let mut builder = DryRunBuilder::new();
        builder.set_mtu(1400);
        let json = serde_json::to_string(&builder.call_log().snapshot()).unwrap();

        assert_eq!(json, r#"[{"call":"set_mtu","mtu":1400}]"#);
    }
}
