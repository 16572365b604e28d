//! Second-opinion re-probe of scan positives on a blocking thread pool.
//!
//! Runs after the async sweep has wound down, on plain OS threads, so
//! a hung verification can never stall the runtime. Results are
//! advisory: a failed re-check marks the address suspect but does not
//! remove it from the scan's output.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HOST, LOCATION};
use reqwest::redirect::Policy;

use edgesweep_core::{Outcome, Verdict, VerificationRecord};
use redirect_probe::{browser_headers, classify, transport_cause, ProbeSignature, USER_AGENT};

pub const DEFAULT_WORKERS: usize = 10;
pub const DEFAULT_SAMPLE: usize = 10;

#[derive(Debug, Clone)]
pub struct VerifyOptions {
    /// OS threads working through the address list.
    pub workers: usize,
}

impl Default for VerifyOptions {
    fn default() -> Self {
        VerifyOptions { workers: DEFAULT_WORKERS }
    }
}

/// Blocking client with the same knobs as the sweep client, so a
/// verification probe asks the same question the scan did.
pub fn build_blocking_client(sig: &ProbeSignature) -> Result<Client> {
    Client::builder()
        .redirect(Policy::none())
        .danger_accept_invalid_certs(true)
        .timeout(sig.timeout)
        .connect_timeout(sig.connect_timeout)
        .user_agent(USER_AGENT)
        .default_headers(browser_headers())
        .http1_only()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(1)
        .build()
        .context("failed to build verification client")
}

/// Re-probe one address under the sweep's classification rule.
pub fn verify_one(client: &Client, sig: &ProbeSignature, addr: Ipv4Addr) -> Verdict {
    let outcome = match client.get(sig.url_for(addr)).header(HOST, sig.host.as_str()).send() {
        Ok(resp) => {
            let location = resp.headers().get(LOCATION).map(|v| v.as_bytes());
            classify(resp.status(), location, &sig.location)
        }
        Err(e) => Outcome::Unreachable(transport_cause(&e)),
    };
    Verdict { addr, outcome }
}

/// Re-probe every address across `workers` threads.
pub fn verify(
    addrs: &[Ipv4Addr],
    sig: &ProbeSignature,
    opts: &VerifyOptions,
) -> Result<Vec<VerificationRecord>> {
    let client = build_blocking_client(sig)?;
    Ok(verify_with(addrs, opts, |addr| verify_one(&client, sig, addr)))
}

/// Worker-pool core, generic over the probe so tests can fake it.
///
/// Threads pull from a shared cursor over the input, so an address is
/// probed exactly once no matter how the pool is sized. Completion
/// order of the returned records is unspecified.
pub fn verify_with<P>(addrs: &[Ipv4Addr], opts: &VerifyOptions, probe: P) -> Vec<VerificationRecord>
where
    P: Fn(Ipv4Addr) -> Verdict + Sync,
{
    if addrs.is_empty() {
        return Vec::new();
    }
    let workers = opts.workers.max(1).min(addrs.len());
    let cursor = AtomicUsize::new(0);
    let (tx, rx) = mpsc::channel::<VerificationRecord>();

    thread::scope(|s| {
        for _ in 0..workers {
            let tx = tx.clone();
            let cursor = &cursor;
            let probe = &probe;
            s.spawn(move || loop {
                let i = cursor.fetch_add(1, Ordering::Relaxed);
                let Some(&addr) = addrs.get(i) else { break };
                let verdict = probe(addr);
                let record = VerificationRecord {
                    addr,
                    confirmed: verdict.outcome.is_available(),
                };
                let _ = tx.send(record);
            });
        }
        drop(tx);
        rx.iter().collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgesweep_core::state::confirmed_sorted;
    use edgesweep_core::Cause;
    use std::collections::HashSet;

    fn addr(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(198, 51, 100, last)
    }

    #[test]
    fn each_address_is_checked_exactly_once() {
        let addrs: Vec<Ipv4Addr> = (1..=20).map(addr).collect();
        let opts = VerifyOptions { workers: 4 };
        let records = verify_with(&addrs, &opts, Verdict::available);

        assert_eq!(records.len(), addrs.len());
        let seen: HashSet<Ipv4Addr> = records.iter().map(|r| r.addr).collect();
        assert_eq!(seen, addrs.iter().copied().collect::<HashSet<_>>());
        assert!(records.iter().all(|r| r.confirmed));
    }

    #[test]
    fn failures_mark_the_record_unconfirmed() {
        let addrs = vec![addr(1), addr(2), addr(3)];
        let opts = VerifyOptions { workers: 2 };
        let records = verify_with(&addrs, &opts, |a| {
            if a == addr(2) {
                Verdict::unreachable(a, Cause::Timeout)
            } else {
                Verdict::available(a)
            }
        });

        assert_eq!(records.len(), 3);
        assert_eq!(records.iter().filter(|r| r.confirmed).count(), 2);
        assert_eq!(confirmed_sorted(&records), vec![addr(1), addr(3)]);
    }

    #[test]
    fn oversized_pool_is_clamped_to_the_input() {
        let addrs = vec![addr(7)];
        let opts = VerifyOptions { workers: 64 };
        let records = verify_with(&addrs, &opts, Verdict::available);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].addr, addr(7));
    }

    #[test]
    fn empty_input_spawns_nothing() {
        let records = verify_with(&[], &VerifyOptions::default(), Verdict::available);
        assert!(records.is_empty());
    }
}
