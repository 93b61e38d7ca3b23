//! Implements the hypervisor core configuration builder.

/// Identifies one I/O device in the pool the proxy arbitrates between.
pub type IoDevId = usize;

/// Configuration options for the hypervisor core.
///
/// # Example
///
/// ```
/// use hvcore::config::Config;
///
/// // Arbitrate between four I/O devices, with device 1 acting as the console UART that
/// // receives cold-boot notifications.
/// let config = Config::builder()
///     .num_iodevs(4)
///     .console(1)
///     .build();
/// ```
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub struct Config {
    /// Number of I/O devices the proxy polls for commands.
    pub(crate) num_iodevs: usize,
    /// Device that receives the startup notification before any device is bound.
    pub(crate) console: IoDevId,
}

impl Config {
    /// Returns a builder initialized with the defaults: a two-device pool with device 0 as the
    /// console.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config {
                num_iodevs: 2,
                console: 0,
            },
        }
    }

    /// Returns the number of I/O devices in the pool.
    pub fn num_iodevs(&self) -> usize {
        self.num_iodevs
    }

    /// Returns the console device id.
    pub fn console(&self) -> IoDevId {
        self.console
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

/// Builder for [`Config`].
#[derive(Copy, Clone, Debug)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Sets the number of I/O devices the proxy arbitrates between.
    pub fn num_iodevs(mut self, num: usize) -> Self {
        self.config.num_iodevs = num;
        self
    }

    /// Sets the console device id.
    pub fn console(mut self, dev: IoDevId) -> Self {
        self.config.console = dev;
        self
    }

    /// Builds the configuration.
    pub fn build(self) -> Config {
        self.config
    }
}
