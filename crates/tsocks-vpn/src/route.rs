//! Route Policy
//!
//! Turns the user's comma-separated route list into concrete routes for the
//! tunnel interface.
//!
//! # Token grammar
//!
//! | Form | Family | Prefix |
//! |------|--------|--------|
//! | `a.b.c.d` | IPv4 | 32 |
//! | `a.b.c.d/n` | IPv4 | n (0-32) |
//! | `x:y::z` | IPv6 | 128 |
//! | `x:y::z/n` | IPv6 | n (0-128) |
//!
//! Anything else is a [`RouteParseWarning`]: the token is skipped and the
//! rest of the list is still resolved. Routes for a disabled address family
//! are dropped without a warning.
//!
//! # Modes
//!
//! In [`RouteMode::Capture`] the listed prefixes become extra capture routes
//! next to the default route. In [`RouteMode::Bypass`] the default route is
//! replaced by its complement around every listed prefix, so those prefixes
//! never enter the tunnel:
//!
//! ```text
//! 0.0.0.0/0 minus 128.0.0.0/1  =>  0.0.0.0/1
//! ```

use crate::settings::RouteMode;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Serialize, Serializer};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::debug;

/// IP address family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum AddressFamily {
    #[serde(rename = "ipv4")]
    V4,
    #[serde(rename = "ipv6")]
    V6,
}

impl AddressFamily {
    /// Longest valid prefix for this family
    pub fn max_prefix_len(&self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }

    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "IPv4"),
            AddressFamily::V6 => write!(f, "IPv6"),
        }
    }
}

/// Which address families the interface is configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Families {
    pub ipv4: bool,
    pub ipv6: bool,
}

impl Families {
    pub fn new(ipv4: bool, ipv6: bool) -> Self {
        Self { ipv4, ipv6 }
    }

    pub fn is_enabled(&self, family: AddressFamily) -> bool {
        match family {
            AddressFamily::V4 => self.ipv4,
            AddressFamily::V6 => self.ipv6,
        }
    }

    /// Enabled families, IPv4 first
    pub fn enabled(&self) -> impl Iterator<Item = AddressFamily> + '_ {
        [AddressFamily::V4, AddressFamily::V6]
            .into_iter()
            .filter(|family| self.is_enabled(*family))
    }

    pub fn any(&self) -> bool {
        self.ipv4 || self.ipv6
    }
}

/// A single route on the tunnel interface.
///
/// Always stored in network form: host bits below the prefix are cleared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RouteSpec {
    net: IpNet,
}

impl RouteSpec {
    /// Build a route, rejecting prefix lengths beyond the family maximum
    pub fn new(addr: IpAddr, prefix_len: u8) -> Option<Self> {
        IpNet::new(addr, prefix_len).ok().map(Self::from)
    }

    /// The unrestricted route for a family (`0.0.0.0/0` or `::/0`)
    pub fn default_route(family: AddressFamily) -> Self {
        let net = match family {
            AddressFamily::V4 => IpNet::V4(Ipv4Net::default()),
            AddressFamily::V6 => IpNet::V6(Ipv6Net::default()),
        };
        Self { net }
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.net.addr())
    }

    /// Network address
    pub fn address(&self) -> IpAddr {
        self.net.addr()
    }

    pub fn prefix_len(&self) -> u8 {
        self.net.prefix_len()
    }

    pub fn is_default(&self) -> bool {
        self.net.prefix_len() == 0
    }

    /// Does this route cover every address of `other`?
    pub fn covers(&self, other: &RouteSpec) -> bool {
        self.net.contains(&other.net)
    }

    pub fn as_net(&self) -> IpNet {
        self.net
    }
}

impl From<IpNet> for RouteSpec {
    fn from(net: IpNet) -> Self {
        Self { net: net.trunc() }
    }
}

impl fmt::Display for RouteSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.net.addr(), self.net.prefix_len())
    }
}

impl Serialize for RouteSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// A route-list token that could not be used. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteParseWarning {
    #[error("Skipping route `{0}`: not an IPv4 or IPv6 address")]
    Unrecognized(String),

    #[error("Skipping route `{0}`: invalid prefix length")]
    InvalidPrefix(String),
}

/// Outcome of parsing a route list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteSet {
    /// Valid routes of enabled families, in list order, without duplicates
    pub routes: Vec<RouteSpec>,
    /// Skipped tokens
    pub warnings: Vec<RouteParseWarning>,
}

impl RouteSet {
    /// Newline-separated canonical form, as handed to the forwarding engine
    pub fn to_engine_text(&self) -> String {
        self.routes
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Parse a comma-separated route list.
///
/// Malformed tokens end up in [`RouteSet::warnings`]; routes whose family is
/// not enabled are dropped silently.
pub fn resolve_routes(raw: &str, families: Families) -> RouteSet {
    let mut set = RouteSet::default();

    for token in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match parse_token(token) {
            Ok(route) if !families.is_enabled(route.family()) => {
                debug!("Dropping {} route {} (family disabled)", route.family(), route);
            }
            Ok(route) => {
                if !set.routes.contains(&route) {
                    set.routes.push(route);
                }
            }
            Err(warning) => set.warnings.push(warning),
        }
    }

    set
}

/// Classify and parse a single trimmed token
fn parse_token(token: &str) -> Result<RouteSpec, RouteParseWarning> {
    let (addr, prefix) = match token.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (token, None),
    };

    let addr: IpAddr = if is_dotted_quad(addr) {
        addr.parse::<Ipv4Addr>()
            .map(IpAddr::V4)
            .map_err(|_| RouteParseWarning::Unrecognized(token.to_string()))?
    } else if addr.contains(':') && !addr.contains('.') {
        addr.parse::<Ipv6Addr>()
            .map(IpAddr::V6)
            .map_err(|_| RouteParseWarning::Unrecognized(token.to_string()))?
    } else {
        return Err(RouteParseWarning::Unrecognized(token.to_string()));
    };

    let family = AddressFamily::of(&addr);
    let prefix_len = match prefix {
        None => family.max_prefix_len(),
        Some(p) if !p.is_empty() && p.len() <= 3 && p.bytes().all(|b| b.is_ascii_digit()) => p
            .parse::<u8>()
            .map_err(|_| RouteParseWarning::InvalidPrefix(token.to_string()))?,
        Some(_) => return Err(RouteParseWarning::InvalidPrefix(token.to_string())),
    };

    RouteSpec::new(addr, prefix_len).ok_or_else(|| RouteParseWarning::InvalidPrefix(token.to_string()))
}

/// Four dot-separated groups of one to three decimal digits
fn is_dotted_quad(s: &str) -> bool {
    let groups: Vec<&str> = s.split('.').collect();
    groups.len() == 4
        && groups
            .iter()
            .all(|g| (1..=3).contains(&g.len()) && g.bytes().all(|b| b.is_ascii_digit()))
}

/// Routes to install on the interface.
///
/// Every enabled family gets its default route. In capture mode the listed
/// routes are added on top; in bypass mode the default route is punched
/// around them instead.
pub fn capture_routes(listed: &[RouteSpec], families: Families, mode: RouteMode) -> Vec<RouteSpec> {
    let mut routes = Vec::new();

    for family in families.enabled() {
        let base = RouteSpec::default_route(family);
        let of_family = listed.iter().filter(|r| r.family() == family);

        match mode {
            RouteMode::Capture => {
                routes.push(base);
                routes.extend(of_family.filter(|r| !r.is_default()).copied());
            }
            RouteMode::Bypass => {
                let holes: Vec<RouteSpec> = of_family.copied().collect();
                routes.extend(punch_routes(base, &holes));
            }
        }
    }

    routes
}

/// Complement of `holes` within `base`, as a sorted minimal prefix list
pub fn punch_routes(base: RouteSpec, holes: &[RouteSpec]) -> Vec<RouteSpec> {
    let holes: Vec<IpNet> = holes
        .iter()
        .filter(|h| h.family() == base.family())
        .map(|h| h.net)
        .collect();

    let mut out = Vec::new();
    punch_into(base.net, &holes, &mut out);
    out.into_iter().map(RouteSpec::from).collect()
}

fn punch_into(net: IpNet, holes: &[IpNet], out: &mut Vec<IpNet>) {
    if holes.iter().any(|h| h.contains(&net)) {
        return;
    }
    if !holes.iter().any(|h| net.contains(h)) {
        out.push(net);
        return;
    }
    // A hole sits strictly inside `net`, so it can still be halved.
    if let Ok(halves) = net.subnets(net.prefix_len() + 1) {
        for half in halves {
            punch_into(half, holes, out);
        }
    }
}
