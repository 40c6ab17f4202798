//! Server Selection
//!
//! Picks an egress server for the device. There is no latency data at
//! selection time, so the device's timezone is used as a proxy for
//! distance: the server whose GMT offset is closest wins.
//!
//! Ties are broken uniformly at random. Several servers usually share a
//! timezone and the random pick spreads devices across them.

use crate::server::Server;
use chrono::{Local, Offset};
use rand::Rng;
use rand::seq::SliceRandom;
use std::fmt;

/// Server selection policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMethod {
    /// Closest server by timezone
    Automatic,
    /// Exact server by name, falling back to [`SelectionMethod::Automatic`]
    PreferredServer(String),
    /// Closest server other than the named one
    AvoidServer(String),
}

impl fmt::Display for SelectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionMethod::Automatic => write!(f, "automatic"),
            SelectionMethod::PreferredServer(name) => write!(f, "prefer {}", name),
            SelectionMethod::AvoidServer(name) => write!(f, "avoid {}", name),
        }
    }
}

/// Where the device believes it is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceTimezone {
    /// Local timezone of the host, read on every selection
    #[default]
    System,
    /// Fixed offset in seconds east of GMT
    Fixed(i32),
}

impl DeviceTimezone {
    pub fn seconds_from_gmt(&self) -> i32 {
        match self {
            DeviceTimezone::System => Local::now().offset().fix().local_minus_utc(),
            DeviceTimezone::Fixed(offset) => *offset,
        }
    }
}

/// Closest servers to `device_offset`, ties broken by `rng`.
///
/// Returns `None` only when `servers` is empty.
pub fn closest_server<'a, I, R>(servers: I, device_offset: i32, rng: &mut R) -> Option<&'a Server>
where
    I: IntoIterator<Item = &'a Server>,
    R: Rng + ?Sized,
{
    let mut best_distance = i64::MAX;
    let mut closest: Vec<&'a Server> = Vec::new();

    for server in servers {
        let distance = (i64::from(device_offset) - i64::from(server.timezone_offset())).abs();

        if distance < best_distance {
            best_distance = distance;
            closest.clear();
            closest.push(server);
        } else if distance == best_distance {
            closest.push(server);
        }
    }

    closest.choose(rng).copied()
}

/// Apply `method` to `servers`
pub fn select_server<'a, R>(
    servers: &'a [Server],
    method: &SelectionMethod,
    device_offset: i32,
    rng: &mut R,
) -> Option<&'a Server>
where
    R: Rng + ?Sized,
{
    match method {
        SelectionMethod::Automatic => closest_server(servers, device_offset, rng),
        SelectionMethod::PreferredServer(name) => servers
            .iter()
            .find(|server| server.name() == name)
            .or_else(|| closest_server(servers, device_offset, rng)),
        SelectionMethod::AvoidServer(name) => closest_server(
            servers.iter().filter(|server| server.name() != name),
            device_offset,
            rng,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test_support::server;
    use rand::SeedableRng;
    use rand::rngs::StdRng;
    use std::collections::HashSet;

    const PACIFIC: i32 = -8 * 3600;
    const MOUNTAIN: i32 = -7 * 3600;
    const CENTRAL: i32 = -6 * 3600;
    const EASTERN: i32 = -5 * 3600;

    /// Six servers across the four US timezones
    fn us_servers() -> Vec<Server> {
        vec![
            server("egress.usw.1", PACIFIC),
            server("egress.usw.2", PACIFIC),
            server("egress.usw.3", MOUNTAIN),
            server("egress.usc.1", CENTRAL),
            server("egress.use.1", EASTERN),
            server("egress.use.2", EASTERN),
        ]
    }

    #[test]
    fn test_pacific_selects_west_coast() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..50 {
            let selected = closest_server(&servers, PACIFIC, &mut rng).unwrap();
            assert!(selected.name().starts_with("egress.usw"));
        }
    }

    #[test]
    fn test_eastern_selects_east_coast() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(2);

        for _ in 0..50 {
            let selected = closest_server(&servers, EASTERN, &mut rng).unwrap();
            assert!(selected.name().starts_with("egress.use"));
        }
    }

    #[test]
    fn test_selection_is_minimal() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(3);

        for device_offset in (-12..=14).map(|h| h * 3600) {
            let selected = closest_server(&servers, device_offset, &mut rng).unwrap();
            let distance = (device_offset - selected.timezone_offset()).abs();
            let minimum = servers
                .iter()
                .map(|s| (device_offset - s.timezone_offset()).abs())
                .min()
                .unwrap();

            assert_eq!(distance, minimum, "offset {}", device_offset);
        }
    }

    #[test]
    fn test_tie_set_is_fully_reachable() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(4);
        let mut names = HashSet::new();

        for _ in 0..100 {
            names.insert(closest_server(&servers, PACIFIC, &mut rng).unwrap().name().to_string());
        }

        let expected: HashSet<String> = ["egress.usw.1", "egress.usw.2"]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_single_best_is_deterministic() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(5);

        for _ in 0..20 {
            assert_eq!(closest_server(&servers, CENTRAL, &mut rng).unwrap().name(), "egress.usc.1");
        }
    }

    #[test]
    fn test_empty_list() {
        let mut rng = StdRng::seed_from_u64(6);
        assert!(closest_server(&[], PACIFIC, &mut rng).is_none());
        assert!(select_server(&[], &SelectionMethod::Automatic, PACIFIC, &mut rng).is_none());
    }

    #[test]
    fn test_preferred_server() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(7);
        let method = SelectionMethod::PreferredServer("egress.use.2".to_string());

        let selected = select_server(&servers, &method, PACIFIC, &mut rng).unwrap();
        assert_eq!(selected.name(), "egress.use.2");
    }

    #[test]
    fn test_missing_preferred_server_falls_back_to_automatic() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(8);
        let method = SelectionMethod::PreferredServer("does-not-exist".to_string());

        let selected = select_server(&servers, &method, EASTERN, &mut rng).unwrap();
        assert!(selected.name().starts_with("egress.use"));
    }

    #[test]
    fn test_avoid_server() {
        let servers = us_servers();
        let mut rng = StdRng::seed_from_u64(9);
        let method = SelectionMethod::AvoidServer("egress.usc.1".to_string());

        for _ in 0..50 {
            let selected = select_server(&servers, &method, CENTRAL, &mut rng).unwrap();
            assert_ne!(selected.name(), "egress.usc.1");
            assert!(selected.name() == "egress.usw.3" || selected.name().starts_with("egress.use"));
        }
    }

    #[test]
    fn test_avoiding_only_server_selects_nothing() {
        let servers = vec![server("egress.usw.1", PACIFIC)];
        let mut rng = StdRng::seed_from_u64(10);
        let method = SelectionMethod::AvoidServer("egress.usw.1".to_string());

        assert!(select_server(&servers, &method, PACIFIC, &mut rng).is_none());
    }

    #[test]
    fn test_fixed_timezone() {
        assert_eq!(DeviceTimezone::Fixed(EASTERN).seconds_from_gmt(), EASTERN);
    }
}
