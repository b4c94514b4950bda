//! # DRAM Power Sampling
//!
//! One sampler per physical package. Each measurement window runs an
//! independent background thread sampling the package's power reader at a
//! fixed period, maintaining a running average and peak; closing the window
//! joins the thread and yields the [`PowerSample`].
//!
//! Platforms without a usable driver get [`NullPowerReader`], an explicit
//! null object whose samples are always unavailable — row assembly never has
//! to special-case absence. On Linux, [`RaplPowerReader`] converts powercap
//! `energy_uj` counter deltas into watts, preferring a package's `dram`
//! subdomain over the package domain and correcting counter wraparound via
//! `max_energy_range_uj`.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// Period between consecutive power samples within a window.
pub const SAMPLING_PERIOD: Duration = Duration::from_millis(100);

/// Average and peak power over one measurement window.
///
/// `None` metrics are the explicit "unavailable" marker produced by null
/// readers and empty windows.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSample {
    /// Physical package the sample describes.
    pub package: usize,
    /// Average watts over the window, when available.
    pub average_watts: Option<f64>,
    /// Peak watts over the window, when available.
    pub peak_watts: Option<f64>,
}

impl PowerSample {
    /// The unavailable marker for a package.
    #[must_use]
    pub fn unavailable(package: usize) -> Self {
        Self {
            package,
            average_watts: None,
            peak_watts: None,
        }
    }

    /// True when the window produced numeric power data.
    #[must_use]
    pub fn is_available(&self) -> bool {
        self.average_watts.is_some()
    }
}

/// Capability interface for per-package DRAM power measurement.
pub trait DramPowerReader: Send {
    /// Human-readable reader name, used in report headers.
    fn name(&self) -> &str;

    /// True when the reader can produce numeric samples at all.
    fn is_available(&self) -> bool {
        true
    }

    /// Samples instantaneous power in watts. `None` when no figure is
    /// available yet (first sample of a delta-based reader) or ever (null
    /// readers).
    fn sample_watts(&mut self) -> Option<f64>;
}

/// Null-object reader for packages without a power driver.
#[derive(Debug)]
pub struct NullPowerReader {
    name: String,
}

impl NullPowerReader {
    /// Creates the null reader for a package.
    #[must_use]
    pub fn new(package: usize) -> Self {
        Self {
            name: format!("Socket {package} DRAM"),
        }
    }
}

impl DramPowerReader for NullPowerReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_available(&self) -> bool {
        false
    }

    fn sample_watts(&mut self) -> Option<f64> {
        None
    }
}

/// Intel RAPL powercap reader for one package.
#[cfg(target_os = "linux")]
#[derive(Debug)]
pub struct RaplPowerReader {
    name: String,
    energy_path: std::path::PathBuf,
    max_range_uj: u64,
    last: Option<(u64, std::time::Instant)>,
}

#[cfg(target_os = "linux")]
impl RaplPowerReader {
    /// Probes powercap sysfs for a readable energy counter of `package`.
    ///
    /// Returns `None` when no counter exists or is readable; callers degrade
    /// to [`NullPowerReader`].
    #[must_use]
    pub fn for_package(package: usize) -> Option<Self> {
        let domain = Self::find_domain(package)?;
        let energy_path = domain.join("energy_uj");
        // Readability check up front: permission failures surface here, not
        // mid-window.
        std::fs::read_to_string(&energy_path).ok()?;

        let max_range_uj = std::fs::read_to_string(domain.join("max_energy_range_uj"))
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(0);

        Some(Self {
            name: format!("Socket {package} DRAM"),
            energy_path,
            max_range_uj,
            last: None,
        })
    }

    /// Locates the RAPL domain directory for a package, preferring its
    /// `dram` subdomain.
    fn find_domain(package: usize) -> Option<std::path::PathBuf> {
        use std::path::PathBuf;

        let roots = [
            PathBuf::from(format!(
                "/sys/class/powercap/intel-rapl/intel-rapl:{package}"
            )),
            PathBuf::from(format!("/sys/class/powercap/intel-rapl:{package}")),
        ];

        for root in roots {
            if !root.is_dir() {
                continue;
            }
            for sub in 0..8 {
                let subdomain = root.join(format!("intel-rapl:{package}:{sub}"));
                let name = subdomain.join("name");
                if let Ok(contents) = std::fs::read_to_string(&name) {
                    if contents.trim() == "dram" {
                        return Some(subdomain);
                    }
                }
            }
            return Some(root);
        }
        None
    }

    fn read_energy_uj(&self) -> Option<u64> {
        std::fs::read_to_string(&self.energy_path)
            .ok()?
            .trim()
            .parse()
            .ok()
    }
}

#[cfg(target_os = "linux")]
impl DramPowerReader for RaplPowerReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_watts(&mut self) -> Option<f64> {
        let now = std::time::Instant::now();
        let energy = self.read_energy_uj()?;
        let previous = self.last.replace((energy, now));
        let (prev_energy, prev_time) = previous?;

        let elapsed = now.duration_since(prev_time).as_secs_f64();
        if elapsed <= 0.0 {
            return None;
        }

        let delta_uj = if energy >= prev_energy {
            energy - prev_energy
        } else if self.max_range_uj > 0 {
            // Counter wrapped within the window.
            energy + (self.max_range_uj - prev_energy)
        } else {
            return None;
        };

        #[allow(clippy::cast_precision_loss)]
        let watts = delta_uj as f64 / 1_000_000.0 / elapsed;
        Some(watts)
    }
}

#[derive(Debug, Default)]
struct WindowStats {
    sum: f64,
    count: u64,
    peak: f64,
}

#[derive(Debug, Default)]
struct Shared {
    stats: Mutex<WindowStats>,
    stop: AtomicBool,
}

/// Background sampling loop for one package, bracketing one measurement
/// window per benchmark configuration.
pub struct PowerSampler {
    package: usize,
    reader_name: String,
    reader: Option<Box<dyn DramPowerReader>>,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<Box<dyn DramPowerReader>>>,
}

impl std::fmt::Debug for PowerSampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerSampler")
            .field("package", &self.package)
            .field("reader", &self.reader_name)
            .field("window_open", &self.handle.is_some())
            .finish()
    }
}

impl PowerSampler {
    /// Wraps a reader for one package.
    #[must_use]
    pub fn new(package: usize, reader: Box<dyn DramPowerReader>) -> Self {
        let reader_name = reader.name().to_string();
        Self {
            package,
            reader_name,
            reader: Some(reader),
            shared: Arc::new(Shared::default()),
            handle: None,
        }
    }

    /// Constructs the sampler for a package with the best reader the platform
    /// offers, degrading to the null object.
    #[must_use]
    pub fn for_package(package: usize) -> Self {
        #[cfg(target_os = "linux")]
        {
            if let Some(reader) = RaplPowerReader::for_package(package) {
                return Self::new(package, Box::new(reader));
            }
            tracing::warn!(
                "no readable RAPL domain for package {package}; power will be reported as N/A"
            );
        }
        Self::new(package, Box::new(NullPowerReader::new(package)))
    }

    /// Physical package this sampler covers.
    #[must_use]
    pub fn package(&self) -> usize {
        self.package
    }

    /// Reader name for report headers.
    #[must_use]
    pub fn reader_name(&self) -> &str {
        &self.reader_name
    }

    /// Opens a measurement window, spawning the sampling thread. A no-op for
    /// unavailable readers and already-open windows.
    pub fn start_window(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let Some(mut reader) = self.reader.take() else {
            return;
        };
        if !reader.is_available() {
            self.reader = Some(reader);
            return;
        }

        *self.shared.stats.lock() = WindowStats::default();
        self.shared.stop.store(false, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let package = self.package;
        let spawned = std::thread::Builder::new()
            .name(format!("memprobe-power-{package}"))
            .spawn(move || {
                let poll = SAMPLING_PERIOD / 10;
                while !shared.stop.load(Ordering::Acquire) {
                    if let Some(watts) = reader.sample_watts() {
                        let mut stats = shared.stats.lock();
                        stats.sum += watts;
                        stats.count += 1;
                        stats.peak = stats.peak.max(watts);
                    }
                    // Sleep the period in slices so window close stays prompt.
                    let deadline = std::time::Instant::now() + SAMPLING_PERIOD;
                    while std::time::Instant::now() < deadline
                        && !shared.stop.load(Ordering::Acquire)
                    {
                        std::thread::sleep(poll);
                    }
                }
                reader
            });

        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(err) => {
                tracing::warn!("failed to spawn power sampler for package {package}: {err}");
            }
        }
    }

    /// Closes the window: joins the sampling thread and returns the sample.
    /// Windows that never opened (null reader, spawn failure) produce the
    /// unavailable marker.
    pub fn stop_window(&mut self) -> PowerSample {
        let Some(handle) = self.handle.take() else {
            return PowerSample::unavailable(self.package);
        };

        self.shared.stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(reader) => self.reader = Some(reader),
            Err(_) => {
                tracing::warn!("power sampler thread for package {} panicked", self.package);
            }
        }

        let stats = self.shared.stats.lock();
        if stats.count == 0 {
            return PowerSample::unavailable(self.package);
        }
        #[allow(clippy::cast_precision_loss)]
        let average = stats.sum / stats.count as f64;
        PowerSample {
            package: self.package,
            average_watts: Some(average),
            peak_watts: Some(stats.peak),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedReader {
        name: String,
        watts: f64,
    }

    impl DramPowerReader for FixedReader {
        fn name(&self) -> &str {
            &self.name
        }

        fn sample_watts(&mut self) -> Option<f64> {
            Some(self.watts)
        }
    }

    #[test]
    fn null_reader_window_is_unavailable() {
        let mut sampler = PowerSampler::new(0, Box::new(NullPowerReader::new(0)));
        sampler.start_window();
        let sample = sampler.stop_window();
        assert_eq!(sample, PowerSample::unavailable(0));
        assert!(!sample.is_available());
    }

    #[test]
    fn stop_without_start_is_unavailable() {
        let mut sampler = PowerSampler::new(1, Box::new(NullPowerReader::new(1)));
        let sample = sampler.stop_window();
        assert_eq!(sample.package, 1);
        assert!(!sample.is_available());
    }

    #[test]
    fn fixed_reader_window_averages() {
        let reader = FixedReader {
            name: "Socket 0 DRAM".to_string(),
            watts: 42.0,
        };
        let mut sampler = PowerSampler::new(0, Box::new(reader));

        sampler.start_window();
        std::thread::sleep(SAMPLING_PERIOD * 3);
        let sample = sampler.stop_window();

        assert!(sample.is_available());
        assert!((sample.average_watts.unwrap() - 42.0).abs() < f64::EPSILON);
        assert!((sample.peak_watts.unwrap() - 42.0).abs() < f64::EPSILON);
    }

    #[test]
    fn windows_are_reusable() {
        let reader = FixedReader {
            name: "Socket 0 DRAM".to_string(),
            watts: 7.5,
        };
        let mut sampler = PowerSampler::new(0, Box::new(reader));

        for _ in 0..2 {
            sampler.start_window();
            std::thread::sleep(SAMPLING_PERIOD * 2);
            let sample = sampler.stop_window();
            assert!(sample.is_available());
            assert_eq!(sample.peak_watts, Some(7.5));
        }
    }

    #[test]
    fn sampler_names() {
        let sampler = PowerSampler::new(3, Box::new(NullPowerReader::new(3)));
        assert_eq!(sampler.package(), 3);
        assert_eq!(sampler.reader_name(), "Socket 3 DRAM");
    }
}
