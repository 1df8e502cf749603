//! System configuration.
//!
//! The kernel is configured once, before it boots, through a
//! [`SystemConfigurationBuilder`]. The builder can be filled in by hand or
//! from Nachos-style command line arguments:
//!
//! | argument | effect |
//! |---|---|
//! | `-d <chars>` | enable debug categories (see [`DebugFlags`]) |
//! | `-ncpu <n>` | number of CPUs |
//! | `-np <n>` | number of physical pages |
//! | `-eager` / `-lazy` | paging policy |
//! | `-share` | share code frames on fork |
//! | `-rr <quantum>` | round-robin scheduling |
//! | `-mlf <levels> <base>` | multi-level-feedback scheduling |
//! | `-ti <ticks>` | timer interval |
//! | `-q` | silence information messages |

use crate::{
    KernelError,
    addressing::PAGE_SIZE,
    thread::feedback::Policy,
    userprog::address_space::{ForkPolicy, PagingPolicy},
};
use machine::{MAX_CPU, kprint::DebugFlags, timer::DEFAULT_INTERVAL};

/// The validated configuration of a kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemConfiguration {
    /// Number of CPUs of the machine.
    pub num_cpus: usize,
    /// Number of frames of main memory.
    pub num_phys_pages: usize,
    /// How executables are brought into memory.
    pub paging: PagingPolicy,
    /// How fork duplicates the parent's image.
    pub fork: ForkPolicy,
    /// Scheduling policy.
    pub scheduler: Policy,
    /// Ticks between two timer interrupts.
    pub timer_interval: u64,
    /// Size of the user stack of every process, in bytes.
    pub user_stack_size: usize,
    /// Enabled debug categories.
    pub debug: DebugFlags,
    /// Silence `info!` and `warning!` messages.
    pub quite: bool,
}

impl Default for SystemConfiguration {
    fn default() -> Self {
        Self {
            num_cpus: 1,
            num_phys_pages: 128,
            paging: PagingPolicy::Lazy,
            fork: ForkPolicy::Copy,
            scheduler: Policy::default(),
            timer_interval: DEFAULT_INTERVAL,
            user_stack_size: 1024,
            debug: DebugFlags::empty(),
            quite: false,
        }
    }
}

impl SystemConfiguration {
    /// Start building a configuration from the defaults.
    pub fn builder() -> SystemConfigurationBuilder {
        SystemConfigurationBuilder::default()
    }
}

/// A builder for system configuration settings.
///
/// ```
/// use nachos::config::SystemConfigurationBuilder;
///
/// let config = SystemConfigurationBuilder::default()
///     .num_cpus(2)
///     .num_phys_pages(32)
///     .build()
///     .unwrap();
/// assert_eq!(config.num_cpus, 2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct SystemConfigurationBuilder {
    conf: SystemConfiguration,
}

impl SystemConfigurationBuilder {
    /// Sets the number of CPUs.
    pub fn num_cpus(mut self, n: usize) -> Self {
        self.conf.num_cpus = n;
        self
    }

    /// Sets the number of physical pages.
    pub fn num_phys_pages(mut self, n: usize) -> Self {
        self.conf.num_phys_pages = n;
        self
    }

    /// Sets the paging policy.
    pub fn paging(mut self, paging: PagingPolicy) -> Self {
        self.conf.paging = paging;
        self
    }

    /// Sets the fork policy.
    pub fn fork(mut self, fork: ForkPolicy) -> Self {
        self.conf.fork = fork;
        self
    }

    /// Sets the system-wide scheduling policy.
    pub fn scheduler(mut self, policy: Policy) -> Self {
        self.conf.scheduler = policy;
        self
    }

    /// Sets the timer interval.
    pub fn timer_interval(mut self, ticks: u64) -> Self {
        self.conf.timer_interval = ticks;
        self
    }

    /// Sets the size of user stacks.
    pub fn user_stack_size(mut self, bytes: usize) -> Self {
        self.conf.user_stack_size = bytes;
        self
    }

    /// Sets the enabled debug categories.
    pub fn debug(mut self, flags: DebugFlags) -> Self {
        self.conf.debug = flags;
        self
    }

    /// Silence information messages.
    pub fn quite(mut self, quite: bool) -> Self {
        self.conf.quite = quite;
        self
    }

    /// Apply Nachos-style command line arguments on top of the current
    /// settings.
    pub fn parse_args<I, S>(mut self, args: I) -> Result<Self, KernelError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        fn value<T: core::str::FromStr>(arg: Option<impl AsRef<str>>) -> Result<T, KernelError> {
            arg.ok_or(KernelError::InvalidArgument)?
                .as_ref()
                .parse()
                .map_err(|_| KernelError::InvalidArgument)
        }

        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_ref() {
                "-d" => {
                    let chars = args.next().ok_or(KernelError::InvalidArgument)?;
                    self.conf.debug = DebugFlags::from_chars(chars.as_ref())
                        .ok_or(KernelError::InvalidArgument)?;
                }
                "-ncpu" => self.conf.num_cpus = value(args.next())?,
                "-np" => self.conf.num_phys_pages = value(args.next())?,
                "-eager" => self.conf.paging = PagingPolicy::Eager,
                "-lazy" => self.conf.paging = PagingPolicy::Lazy,
                "-share" => self.conf.fork = ForkPolicy::Share,
                "-rr" => {
                    self.conf.scheduler = Policy::RoundRobin {
                        quantum: value(args.next())?,
                    }
                }
                "-mlf" => {
                    let levels = value(args.next())?;
                    let base_quantum = value(args.next())?;
                    self.conf.scheduler = Policy::MultiLevelFeedback {
                        levels,
                        base_quantum,
                    };
                }
                "-ti" => self.conf.timer_interval = value(args.next())?,
                "-q" => self.conf.quite = true,
                _ => return Err(KernelError::InvalidArgument),
            }
        }
        Ok(self)
    }

    /// Validate the settings.
    pub fn build(self) -> Result<SystemConfiguration, KernelError> {
        let conf = self.conf;
        let scheduler_ok = match conf.scheduler {
            Policy::MultiLevelFeedback {
                levels,
                base_quantum,
            } => levels > 0 && levels < 32 && base_quantum > 0,
            Policy::RoundRobin { quantum } => quantum > 0,
        };
        if conf.num_cpus == 0
            || conf.num_cpus > MAX_CPU
            || conf.num_phys_pages == 0
            || conf.timer_interval == 0
            || conf.user_stack_size == 0
            || conf.user_stack_size % PAGE_SIZE != 0
            || !scheduler_ok
        {
            return Err(KernelError::InvalidArgument);
        }
        Ok(conf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_nachos_arguments() {
        let conf = SystemConfigurationBuilder::default()
            .parse_args(["-d", "tM", "-ncpu", "2", "-eager", "-share", "-mlf", "3", "50", "-q"])
            .and_then(SystemConfigurationBuilder::build)
            .unwrap();
        assert_eq!(conf.num_cpus, 2);
        assert_eq!(conf.paging, PagingPolicy::Eager);
        assert_eq!(conf.fork, ForkPolicy::Share);
        assert_eq!(
            conf.scheduler,
            Policy::MultiLevelFeedback {
                levels: 3,
                base_quantum: 50
            }
        );
        assert_eq!(conf.debug, DebugFlags::THREAD | DebugFlags::MEMORY);
        assert!(conf.quite);
    }

    #[test]
    fn reject_bad_settings() {
        let b = SystemConfigurationBuilder::default;
        assert_eq!(
            b().parse_args(["-ncpu"]).err(),
            Some(KernelError::InvalidArgument)
        );
        assert_eq!(
            b().parse_args(["-bogus"]).err(),
            Some(KernelError::InvalidArgument)
        );
        assert_eq!(
            b().num_cpus(MAX_CPU + 1).build(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            b().user_stack_size(PAGE_SIZE + 1).build(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(
            b().timer_interval(0).build(),
            Err(KernelError::InvalidArgument)
        );
        assert_eq!(b().build(), Ok(SystemConfiguration::default()));
    }
}
