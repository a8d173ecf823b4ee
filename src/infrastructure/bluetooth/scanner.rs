//! BLE Scanner Module
//!
//! Discovers WeDo 2.0 hubs through the adapter's advertisement stream.

use crate::domain::settings::ScanSettings;
use crate::infrastructure::bluetooth::adapter::{Advertisement, BleAdapter};
use crate::infrastructure::bluetooth::error::HubError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Whether an advertisement looks like a WeDo hub under `settings`.
pub fn matches_hub(advertisement: &Advertisement, settings: &ScanSettings) -> bool {
    if advertisement.rssi <= settings.min_rssi {
        return false;
    }
    let name = advertisement.name.to_uppercase();
    let address = advertisement.address.to_uppercase();

    settings
        .name_patterns
        .iter()
        .any(|pattern| name.contains(&pattern.to_uppercase()))
        || settings
            .address_prefixes
            .iter()
            .any(|prefix| address.starts_with(&prefix.to_uppercase()))
}

enum ScanEnd {
    Done,
    TimedOut,
    Cancelled,
}

/// Scanner for WeDo hubs
///
/// Every scan stops the adapter again on the way out, whether it ended by
/// match, timeout or cancellation.
pub struct HubScanner {
    adapter: Arc<dyn BleAdapter>,
    settings: ScanSettings,
    cancel: watch::Receiver<u64>,
}

impl HubScanner {
    /// `cancel` is a generation counter; any change aborts the scan.
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        settings: ScanSettings,
        cancel: watch::Receiver<u64>,
    ) -> Self {
        Self {
            adapter,
            settings,
            cancel,
        }
    }

    /// Collects matching hubs for up to `timeout`, deduplicated by address.
    /// With `stop_on_first` the scan ends at the first match.
    pub async fn scan(&mut self, timeout: Duration) -> Result<Vec<Advertisement>, HubError> {
        info!("Scanning for WeDo hubs ({:?})...", timeout);
        let stop_on_first = self.settings.stop_on_first;
        let mut found: Vec<Advertisement> = Vec::new();

        let end = self
            .run(timeout, |adv| {
                match found.iter_mut().find(|f| f.address == adv.address) {
                    Some(existing) => *existing = adv,
                    None => {
                        info!("Found hub: {} [{}] {} dBm", adv.name, adv.address, adv.rssi);
                        found.push(adv);
                    }
                }
                stop_on_first
            })
            .await?;

        if let ScanEnd::Cancelled = end {
            debug!("Scan cancelled with {} hub(s) found", found.len());
        }
        info!("Scan finished: {} hub(s)", found.len());
        Ok(found)
    }

    /// Scans until the hub with `address` is seen.
    pub async fn find(&mut self, address: &str, timeout: Duration) -> Result<Advertisement, HubError> {
        info!("Looking for hub {}...", address);
        let mut target = None;

        let end = self
            .run(timeout, |adv| {
                if adv.address.eq_ignore_ascii_case(address) {
                    target = Some(adv);
                    true
                } else {
                    false
                }
            })
            .await?;

        match (target, end) {
            (Some(adv), _) => Ok(adv),
            (None, ScanEnd::Cancelled) => Err(HubError::NotConnected),
            (None, _) => Err(HubError::Timeout {
                operation: "scan for hub",
                after: timeout,
            }),
        }
    }

    /// Feeds matching advertisements to `on_match` until it returns true,
    /// the deadline passes or the scan is cancelled.
    async fn run(
        &mut self,
        timeout: Duration,
        mut on_match: impl FnMut(Advertisement) -> bool,
    ) -> Result<ScanEnd, HubError> {
        let mut stream = self
            .adapter
            .start_scan()
            .await
            .map_err(HubError::ScanFailed)?;
        let deadline = Instant::now() + timeout;
        let mut cancellable = true;

        let end = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break ScanEnd::TimedOut,
                changed = self.cancel.changed(), if cancellable => {
                    if changed.is_ok() {
                        break ScanEnd::Cancelled;
                    }
                    // Sender gone: nothing can cancel us any more.
                    cancellable = false;
                }
                adv = stream.recv() => match adv {
                    Some(adv) if matches_hub(&adv, &self.settings) => {
                        if on_match(adv) {
                            break ScanEnd::Done;
                        }
                    }
                    Some(adv) => debug!("Skipping advertisement {} [{}]", adv.name, adv.address),
                    None => {
                        warn!("Advertisement stream closed early");
                        break ScanEnd::Done;
                    }
                }
            }
        };

        if let Err(e) = self.adapter.stop_scan().await {
            warn!("Failed to stop scan: {}", e);
        }
        Ok(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::fake::FakeHub;

    fn adv(name: &str, address: &str, rssi: i16) -> Advertisement {
        Advertisement {
            name: name.to_string(),
            address: address.to_string(),
            rssi,
        }
    }

    #[test]
    fn test_filter_by_name_and_prefix() {
        let settings = ScanSettings::default();
        assert!(matches_hub(&adv("LPF2 Smart Hub", "11:22:33:44:55:66", -60), &settings));
        assert!(matches_hub(&adv("my wedo", "11:22:33:44:55:66", -60), &settings));
        assert!(matches_hub(&adv("", "24:71:89:AA:BB:CC", -60), &settings));
        assert!(!matches_hub(&adv("Speaker", "11:22:33:44:55:66", -60), &settings));
    }

    #[test]
    fn test_filter_rssi_is_strict() {
        let settings = ScanSettings::default();
        assert!(!matches_hub(&adv("LEGO Hub", "24:71:89:00:00:01", -80), &settings));
        assert!(!matches_hub(&adv("LEGO Hub", "24:71:89:00:00:01", -95), &settings));
        assert!(matches_hub(&adv("LEGO Hub", "24:71:89:00:00:01", -79), &settings));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_collects_and_always_stops() {
        let hub = FakeHub::new();
        hub.set_advertisements(vec![
            adv("Speaker", "11:22:33:44:55:66", -40),
            adv("LPF2 Smart Hub", "24:71:89:00:00:01", -50),
            adv("LPF2 Smart Hub", "24:71:89:00:00:01", -45),
            adv("WeDo", "24:71:89:00:00:02", -70),
        ]);
        let (_tx, rx) = watch::channel(0);
        let settings = ScanSettings {
            stop_on_first: false,
            ..ScanSettings::default()
        };
        let mut scanner = HubScanner::new(Arc::new(hub.clone()), settings, rx);

        let found = scanner.scan(Duration::from_secs(2)).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].rssi, -45);
        assert_eq!(hub.scan_stops(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_find_times_out() {
        let hub = FakeHub::new();
        let (_tx, rx) = watch::channel(0);
        let mut scanner = HubScanner::new(Arc::new(hub.clone()), ScanSettings::default(), rx);

        let err = scanner
            .find("24:71:89:FF:FF:FF", Duration::from_secs(10))
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Timeout { .. }));
        assert_eq!(hub.scan_stops(), 1);

        let found = scanner
            .find("24:71:89:00:00:01", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(found.name, "LPF2 Smart Hub");
        assert_eq!(hub.scan_stops(), 2);
    }
}
