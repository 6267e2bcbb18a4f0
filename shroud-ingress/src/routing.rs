//! Split-routing policy: direct vs. tunneled, decided per target host.

use std::net::IpAddr;

use tracing::debug;

use crate::ranges::RangeTables;

/// Routing policy selected at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RoutingMode {
    /// Tunnel every connection.
    #[value(name = "global")]
    Global,
    /// Send CN destinations direct, tunnel the rest.
    #[value(name = "bypass_cn")]
    BypassCn,
    /// Never tunnel; behave as a transparent local proxy.
    #[value(name = "none")]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Direct,
    Tunnel,
}

/// Decide the route for a target host.
///
/// In `bypass_cn` mode an IP literal is tested against the tables directly;
/// a DNS name goes direct iff any address it resolves to is in a range.
/// Resolution failure defaults to the tunnel.
pub async fn decide(mode: RoutingMode, host: &str, tables: &RangeTables) -> Route {
    match mode {
        RoutingMode::None => Route::Direct,
        RoutingMode::Global => Route::Tunnel,
        RoutingMode::BypassCn => {
            if let Ok(ip) = host.parse::<IpAddr>() {
                return route_for_membership(tables.contains(&ip));
            }
            match tokio::net::lookup_host((host, 80)).await {
                Ok(addrs) => {
                    let direct = addrs.into_iter().any(|a| tables.contains(&a.ip()));
                    route_for_membership(direct)
                }
                Err(e) => {
                    debug!(host, error = %e, "resolve failed, routing to tunnel");
                    Route::Tunnel
                }
            }
        }
    }
}

fn route_for_membership(in_range: bool) -> Route {
    if in_range {
        Route::Direct
    } else {
        Route::Tunnel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tables() -> RangeTables {
        RangeTables::parse("1.0.1.0 1.0.1.255\n", "2400:3200:: 2400:3200::ffff\n").unwrap()
    }

    #[tokio::test]
    async fn none_is_always_direct() {
        assert_eq!(
            decide(RoutingMode::None, "example.com", &tables()).await,
            Route::Direct
        );
    }

    #[tokio::test]
    async fn global_is_always_tunnel() {
        assert_eq!(
            decide(RoutingMode::Global, "1.0.1.1", &tables()).await,
            Route::Tunnel
        );
    }

    #[tokio::test]
    async fn bypass_cn_ip_literals() {
        let t = tables();
        assert_eq!(
            decide(RoutingMode::BypassCn, "1.0.1.1", &t).await,
            Route::Direct
        );
        assert_eq!(
            decide(RoutingMode::BypassCn, "8.8.8.8", &t).await,
            Route::Tunnel
        );
        assert_eq!(
            decide(RoutingMode::BypassCn, "2400:3200::1", &t).await,
            Route::Direct
        );
    }
}
