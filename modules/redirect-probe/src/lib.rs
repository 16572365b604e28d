//! HTTP redirect-signature probing and the bounded-concurrency sweep.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, HOST, LOCATION, UPGRADE_INSECURE_REQUESTS};
use reqwest::redirect::Policy;
use reqwest::{Client, StatusCode};
use tokio::sync::mpsc;
use tracing::debug;

use edgesweep_core::limiter::AdmissionGate;
use edgesweep_core::progress::{ProgressReporter, ProgressTick};
use edgesweep_core::state::{ScanReport, ScanState};
use edgesweep_core::{Cause, Outcome, Verdict};

/// Browser identity presented on every request.
pub const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/116.0.0.0 Mobile Safari/537.36";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_CONCURRENCY: usize = 300;
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);

/// Static browser-shaped headers sent with every probe. `Host` is
/// per-request and `Accept-Encoding` is handled by the client.
pub fn browser_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static(
            "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
        ),
    );
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.9"));
    headers.insert(UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
    headers
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(format!("unsupported scheme {other:?}")),
        }
    }
}

/// The redirect signature being hunted, plus how to ask for it.
///
/// Shared by the sweep and the verification pass so the two cannot
/// drift apart on what counts as a hit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeSignature {
    /// Domain sent as the `Host` header. The request URL stays on the
    /// bare address, so this name never hits DNS or SNI.
    pub host: String,
    /// Expected `Location` value, compared byte for byte.
    pub location: String,
    pub scheme: Scheme,
    pub port: u16,
    pub timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProbeSignature {
    pub fn new(host: impl Into<String>, location: impl Into<String>) -> Self {
        ProbeSignature {
            host: host.into(),
            location: location.into(),
            scheme: Scheme::Http,
            port: Scheme::Http.default_port(),
            timeout: DEFAULT_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Request URL for one address.
    pub fn url_for(&self, addr: Ipv4Addr) -> String {
        format!("{}://{}:{}/", self.scheme, addr, self.port)
    }

    /// Derive a verification-pass signature. A scheme override without
    /// a port override moves to that scheme's default port; a port
    /// override always wins.
    pub fn with_overrides(&self, scheme: Option<Scheme>, port: Option<u16>) -> ProbeSignature {
        let mut out = self.clone();
        if let Some(s) = scheme {
            out.scheme = s;
            out.port = s.default_port();
        }
        if let Some(p) = port {
            out.port = p;
        }
        out
    }
}

/// HTTP client for the async sweep.
///
/// Redirects stay unfollowed so the first response is the one that
/// gets classified, and certificates are not validated because the
/// targets are addressed by raw IP.
pub fn build_client(sig: &ProbeSignature) -> Result<Client> {
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
        .context("failed to build probe client")
}

/// Map a transport failure onto a tally cause.
pub fn transport_cause(err: &reqwest::Error) -> Cause {
    if err.is_timeout() {
        Cause::Timeout
    } else if err.is_connect() {
        Cause::ConnectionRefused
    } else {
        Cause::Other
    }
}

/// Decide a verdict from the first response's status and `Location`.
///
/// Available means exactly status 302 with a `Location` equal to the
/// expected value. Deliberately strict: no case folding, no trailing
/// slash tolerance, no substring matching.
pub fn classify(status: StatusCode, location: Option<&[u8]>, expected: &str) -> Outcome {
    if status != StatusCode::FOUND {
        return Outcome::Unreachable(Cause::StatusMismatch(status.as_u16()));
    }
    match location {
        Some(loc) if loc == expected.as_bytes() => Outcome::Available,
        _ => Outcome::Unreachable(Cause::LocationMismatch),
    }
}

/// Issue one classification request. Failures of any kind collapse
/// into an unreachable verdict; nothing propagates out of a probe.
pub async fn probe_one(client: &Client, sig: &ProbeSignature, addr: Ipv4Addr) -> Verdict {
    let outcome = match client
        .get(sig.url_for(addr))
        .header(HOST, sig.host.as_str())
        .send()
        .await
    {
        Ok(resp) => {
            let location = resp.headers().get(LOCATION).map(|v| v.as_bytes());
            classify(resp.status(), location, &sig.location)
        }
        Err(e) => Outcome::Unreachable(transport_cause(&e)),
    };
    if let Outcome::Unreachable(cause) = outcome {
        debug!(%addr, %cause, "probe miss");
    }
    Verdict { addr, outcome }
}

/// One probe operation. The seam lets the sweep run against fakes.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, addr: Ipv4Addr) -> Verdict;
}

/// Live prober carrying the shared client and signature.
pub struct RedirectProber {
    client: Client,
    sig: ProbeSignature,
}

impl RedirectProber {
    pub fn new(sig: ProbeSignature) -> Result<Self> {
        let client = build_client(&sig)?;
        Ok(RedirectProber { client, sig })
    }

    pub fn signature(&self) -> &ProbeSignature {
        &self.sig
    }
}

#[async_trait]
impl Probe for RedirectProber {
    async fn probe(&self, addr: Ipv4Addr) -> Verdict {
        probe_one(&self.client, &self.sig, addr).await
    }
}

#[derive(Debug, Clone)]
pub struct SweepOptions {
    /// Upper bound on in-flight probes.
    pub concurrency: usize,
    /// Wall-clock cadence for progress events.
    pub report_interval: Duration,
}

impl Default for SweepOptions {
    fn default() -> Self {
        SweepOptions {
            concurrency: DEFAULT_CONCURRENCY,
            report_interval: DEFAULT_REPORT_INTERVAL,
        }
    }
}

/// Streamed observations from a running sweep, in completion order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SweepEvent {
    /// An address answered with the signature.
    Found(Ipv4Addr),
    Progress(ProgressTick),
}

/// Sweep every address through the prober with bounded concurrency.
///
/// Verdicts are folded in completion order, which is why the report's
/// `available` list needs its final sort. Probe failures never abort
/// the sweep; the report's `completed` always reaches `total`.
pub async fn sweep<P, F>(
    prober: Arc<P>,
    addrs: Vec<Ipv4Addr>,
    opts: SweepOptions,
    mut observe: F,
) -> ScanReport
where
    P: Probe + ?Sized + 'static,
    F: FnMut(SweepEvent),
{
    let total = addrs.len();
    let started = Instant::now();
    let gate = AdmissionGate::new(opts.concurrency);
    let (tx, mut rx) = mpsc::channel::<Verdict>(opts.concurrency.max(1));

    let feeder = {
        let gate = gate.clone();
        let prober = prober.clone();
        tokio::spawn(async move {
            for addr in addrs {
                let permit = gate.admit().await;
                let txc = tx.clone();
                let prober = prober.clone();
                tokio::spawn(async move {
                    let verdict = prober.probe(addr).await;
                    let _ = txc.send(verdict).await;
                    drop(permit);
                });
            }
            // tx drops here; rx closes once the in-flight probes finish.
        })
    };

    let mut state = ScanState::started_at(total, started);
    let mut reporter = ProgressReporter::started_at(opts.report_interval, started);
    while let Some(verdict) = rx.recv().await {
        if verdict.outcome.is_available() {
            observe(SweepEvent::Found(verdict.addr));
        }
        state.record(&verdict);
        let now = Instant::now();
        if let Some(tick) = reporter.observe(&state.snapshot(now), now) {
            observe(SweepEvent::Progress(tick));
        }
    }
    let _ = feeder.await;

    let now = Instant::now();
    observe(SweepEvent::Progress(reporter.finalize(&state.snapshot(now), now)));
    state.into_report(now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::sleep;

    #[test]
    fn classify_requires_the_exact_signature() {
        let expected = "https://edge.example.com/landing";
        let hit = classify(StatusCode::FOUND, Some(expected.as_bytes()), expected);
        assert_eq!(hit, Outcome::Available);

        let wrong_status = classify(StatusCode::MOVED_PERMANENTLY, Some(expected.as_bytes()), expected);
        assert_eq!(wrong_status, Outcome::Unreachable(Cause::StatusMismatch(301)));

        let ok_status = classify(StatusCode::OK, None, expected);
        assert_eq!(ok_status, Outcome::Unreachable(Cause::StatusMismatch(200)));

        let missing = classify(StatusCode::FOUND, None, expected);
        assert_eq!(missing, Outcome::Unreachable(Cause::LocationMismatch));

        let trailing = classify(StatusCode::FOUND, Some(b"https://edge.example.com/landing/"), expected);
        assert_eq!(trailing, Outcome::Unreachable(Cause::LocationMismatch));

        let case = classify(StatusCode::FOUND, Some(b"HTTPS://edge.example.com/landing"), expected);
        assert_eq!(case, Outcome::Unreachable(Cause::LocationMismatch));
    }

    #[test]
    fn url_targets_the_bare_address() {
        let sig = ProbeSignature::new("cdn.example.net", "https://cdn.example.net/");
        assert_eq!(sig.url_for(Ipv4Addr::new(203, 0, 113, 9)), "http://203.0.113.9:80/");

        let tls = sig.with_overrides(Some(Scheme::Https), None);
        assert_eq!(tls.port, 443);
        assert_eq!(tls.url_for(Ipv4Addr::new(203, 0, 113, 9)), "https://203.0.113.9:443/");
    }

    #[test]
    fn overrides_favor_an_explicit_port() {
        let sig = ProbeSignature::new("h", "l");
        let v = sig.with_overrides(Some(Scheme::Https), Some(8443));
        assert_eq!((v.scheme, v.port), (Scheme::Https, 8443));

        let port_only = sig.with_overrides(None, Some(8080));
        assert_eq!((port_only.scheme, port_only.port), (Scheme::Http, 8080));

        let untouched = sig.with_overrides(None, None);
        assert_eq!(untouched, sig);
    }

    #[test]
    fn scheme_round_trips_from_str() {
        assert_eq!("http".parse::<Scheme>(), Ok(Scheme::Http));
        assert_eq!("https".parse::<Scheme>(), Ok(Scheme::Https));
        assert!("ftp".parse::<Scheme>().is_err());
    }

    /// Answers the signature for a fixed set of addresses, with
    /// staggered delays so completion order differs from feed order.
    struct FakeEdge {
        hits: HashSet<Ipv4Addr>,
    }

    #[async_trait]
    impl Probe for FakeEdge {
        async fn probe(&self, addr: Ipv4Addr) -> Verdict {
            let ms = (255 - addr.octets()[3]) as u64 % 16 * 3;
            sleep(Duration::from_millis(ms)).await;
            if self.hits.contains(&addr) {
                Verdict::available(addr)
            } else {
                Verdict::unreachable(addr, Cause::Timeout)
            }
        }
    }

    fn block(last: std::ops::RangeInclusive<u8>) -> Vec<Ipv4Addr> {
        last.map(|i| Ipv4Addr::new(192, 0, 2, i)).collect()
    }

    #[tokio::test]
    async fn sweep_finds_signature_hosts_across_a_block() {
        let hits: HashSet<Ipv4Addr> =
            [Ipv4Addr::new(192, 0, 2, 5), Ipv4Addr::new(192, 0, 2, 9)].into_iter().collect();
        let prober = Arc::new(FakeEdge { hits: hits.clone() });

        let opts = SweepOptions { concurrency: 4, report_interval: Duration::from_secs(3600) };
        let mut found = Vec::new();
        let mut ticks = Vec::new();
        let report = sweep(prober, block(1..=14), opts, |event| match event {
            SweepEvent::Found(addr) => found.push(addr),
            SweepEvent::Progress(tick) => ticks.push(tick),
        })
        .await;

        assert_eq!(report.total, 14);
        assert_eq!(report.completed, 14);
        assert_eq!(report.causes.timeout, 12);
        assert_eq!(
            report.sorted_available(),
            vec![Ipv4Addr::new(192, 0, 2, 5), Ipv4Addr::new(192, 0, 2, 9)]
        );
        assert_eq!(found.len(), 2);
        assert_eq!(found.iter().copied().collect::<HashSet<_>>(), hits);
        // Only the forced final tick, and it covers everything.
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].completed, 14);
        assert_eq!(ticks[0].available, 2);
    }

    #[derive(Default)]
    struct CountingProbe {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl Probe for CountingProbe {
        async fn probe(&self, addr: Ipv4Addr) -> Verdict {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Verdict::unreachable(addr, Cause::ConnectionRefused)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn in_flight_probes_never_exceed_the_gate() {
        let prober = Arc::new(CountingProbe::default());
        let addrs: Vec<Ipv4Addr> = (1..=64).map(|i| Ipv4Addr::new(10, 9, 8, i)).collect();

        let opts = SweepOptions { concurrency: 4, report_interval: Duration::from_secs(3600) };
        let report = sweep(prober.clone(), addrs, opts, |_| {}).await;

        assert_eq!(report.completed, 64);
        let peak = prober.peak.load(Ordering::SeqCst);
        assert!(peak <= 4, "peak in-flight was {peak}");
        assert!(peak >= 2, "sweep never overlapped probes");
    }

    #[tokio::test]
    async fn progress_events_flow_while_the_sweep_runs() {
        let prober = Arc::new(FakeEdge { hits: HashSet::new() });
        let opts = SweepOptions { concurrency: 2, report_interval: Duration::ZERO };

        let mut ticks = Vec::new();
        let report = sweep(prober, block(1..=6), opts, |event| {
            if let SweepEvent::Progress(tick) = event {
                ticks.push(tick);
            }
        })
        .await;

        // One per fold plus the forced final.
        assert_eq!(ticks.len(), 7);
        assert_eq!(ticks.iter().map(|t| t.completed).max(), Some(6));
        assert_eq!(ticks.last().map(|t| t.eta_minutes), Some(Some(0.0)));
        assert_eq!(report.unreachable(), 6);
    }

    #[tokio::test]
    async fn empty_input_completes_without_probing() {
        let prober = Arc::new(FakeEdge { hits: HashSet::new() });
        let mut ticks = 0usize;
        let report = sweep(prober, Vec::new(), SweepOptions::default(), |event| {
            if matches!(event, SweepEvent::Progress(_)) {
                ticks += 1;
            }
        })
        .await;

        assert_eq!(report.total, 0);
        assert_eq!(report.completed, 0);
        assert_eq!(ticks, 1);
    }
}
