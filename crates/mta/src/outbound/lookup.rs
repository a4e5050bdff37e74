/*
 * SPDX-FileCopyrightText: 2025 Postrider Project <hello@postrider.dev>
 *
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::net::IpAddr;
use std::sync::Arc;

use mail_auth::{IpLookupStrategy, Resolver};
use rand::seq::SliceRandom;

use super::{Error, ErrorDetails};

pub const MAX_MX: usize = 5;
pub const MAX_MULTIHOMED: usize = 4;

/// Resolves the exchanges to dial for a recipient domain, best first. A zone
/// that pins a next-hop host bypasses DNS entirely. An empty MX answer falls
/// back to the domain's own address records per RFC 5321; when those are
/// missing too, the synthetic `450` reply is attached so the failure flows
/// through the regular defer path.
pub async fn resolve_exchanges(
    resolver: &Resolver,
    pinned_host: Option<&str>,
    domain: &str,
    strategy: IpLookupStrategy,
) -> Result<Vec<String>, Error> {
    if let Some(host) = pinned_host {
        return Ok(vec![host.to_string()]);
    }

    let mx_list = match resolver.mx_lookup(domain).await {
        Ok(mx_list) => mx_list,
        Err(mail_auth::Error::DnsRecordNotFound(_)) => Arc::new(Vec::new()),
        Err(err) => {
            tracing::debug!(
                context = "dns",
                event = "mx-lookup-failed",
                domain = domain,
                reason = %err,
            );
            return Err(Error::mx_not_found(domain));
        }
    };

    if mx_list.is_empty() {
        // Implicit MX: the domain itself, if it resolves at all.
        return match ip_lookup(resolver, domain, strategy, 1).await {
            Ok(ips) if !ips.is_empty() => Ok(vec![domain.to_string()]),
            _ => Err(Error::mx_not_found(domain)),
        };
    }

    let mut entries = mx_list
        .iter()
        .map(|mx| (mx.preference, mx.exchanges.clone()))
        .collect::<Vec<_>>();
    entries.sort_by_key(|(preference, _)| *preference);

    let mut exchanges = Vec::with_capacity(MAX_MX);
    'outer: for (preference, mut hosts) in entries {
        if preference == 0 && hosts.first().map_or(false, |h| h == ".") {
            return Err(Error::null_mx(domain));
        }
        if hosts.len() > 1 {
            hosts.shuffle(&mut rand::thread_rng());
        }
        for host in hosts {
            exchanges.push(host.trim_end_matches('.').to_string());
            if exchanges.len() == MAX_MX {
                break 'outer;
            }
        }
    }
    Ok(exchanges)
}

/// Address lookup for one exchange under the zone's address-family strategy.
/// An empty list is an in-band result; the caller falls through to the next
/// exchange.
pub async fn ip_lookup(
    resolver: &Resolver,
    host: &str,
    strategy: IpLookupStrategy,
    max_results: usize,
) -> Result<Vec<IpAddr>, Error> {
    let (has_ipv4, has_ipv6, v4_first) = match strategy {
        IpLookupStrategy::Ipv4Only => (true, false, false),
        IpLookupStrategy::Ipv6Only => (false, true, false),
        IpLookupStrategy::Ipv4thenIpv6 => (true, true, true),
        IpLookupStrategy::Ipv6thenIpv4 => (true, true, false),
    };

    let ipv4_addrs = if has_ipv4 {
        match resolver.ipv4_lookup(host).await {
            Ok(addrs) => addrs,
            Err(_) if has_ipv6 => Arc::new(Vec::new()),
            Err(err) => return Err(lookup_error(host, err)),
        }
    } else {
        Arc::new(Vec::new())
    };

    if has_ipv6 {
        let ipv6_addrs = match resolver.ipv6_lookup(host).await {
            Ok(addrs) => addrs,
            Err(_) if !ipv4_addrs.is_empty() => Arc::new(Vec::new()),
            Err(err) => return Err(lookup_error(host, err)),
        };
        if v4_first {
            Ok(ipv4_addrs
                .iter()
                .copied()
                .map(IpAddr::from)
                .chain(ipv6_addrs.iter().copied().map(IpAddr::from))
                .take(max_results)
                .collect())
        } else {
            Ok(ipv6_addrs
                .iter()
                .copied()
                .map(IpAddr::from)
                .chain(ipv4_addrs.iter().copied().map(IpAddr::from))
                .take(max_results)
                .collect())
        }
    } else {
        Ok(ipv4_addrs
            .iter()
            .take(max_results)
            .copied()
            .map(IpAddr::from)
            .collect())
    }
}

fn lookup_error(host: &str, err: mail_auth::Error) -> Error {
    Error::Connection(ErrorDetails {
        entity: host.to_string(),
        details: match err {
            mail_auth::Error::DnsRecordNotFound(_) => "record not found for MX".to_string(),
            err => format!("lookup error: {err}"),
        },
    })
}
