//! Coarse metric categories and the policy that filters on them

use std::{collections::BTreeMap, fmt};

use serde::Deserialize;

/// Top-level namespace of a metric name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Category {
    /// `proc.*`
    Process,
    /// `disk.*`
    Disk,
    /// `vfs.*` and `filesys.*`
    File,
    /// `mem.*`
    Memory,
    /// `network.*`
    Network,
    /// `kernel.*`
    Kernel,
    /// `swap.*`
    Swap,
    /// `nfs.*`
    Nfs,
}

impl Category {
    /// Category of `metric`, decided by the segment before the first dot. A
    /// name without a dot, or with an unrecognized first segment, has none.
    #[must_use]
    pub fn of(metric: &str) -> Option<Self> {
        let (segment, _) = metric.split_once('.')?;
        match segment {
            "proc" => Some(Category::Process),
            "disk" => Some(Category::Disk),
            "vfs" | "filesys" => Some(Category::File),
            "mem" => Some(Category::Memory),
            "network" => Some(Category::Network),
            "kernel" => Some(Category::Kernel),
            "swap" => Some(Category::Swap),
            "nfs" => Some(Category::Nfs),
            _ => None,
        }
    }

    /// Name used in configuration and logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Category::Process => "process",
            Category::Disk => "disk",
            Category::File => "file",
            Category::Memory => "memory",
            Category::Network => "network",
            Category::Kernel => "kernel",
            Category::Swap => "swap",
            Category::Nfs => "nfs",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn enabled() -> bool {
    true
}

/// Which categories are exported. Per-process and NFS metrics are off unless
/// asked for, everything else is on.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
#[allow(clippy::struct_excessive_bools)]
pub struct Policy {
    /// Export `proc.*`
    #[serde(default)]
    pub process: bool,
    /// Export `disk.*`
    #[serde(default = "enabled")]
    pub disk: bool,
    /// Export `vfs.*` and `filesys.*`
    #[serde(default = "enabled")]
    pub file: bool,
    /// Export `mem.*`
    #[serde(default = "enabled")]
    pub memory: bool,
    /// Export `network.*`
    #[serde(default = "enabled")]
    pub network: bool,
    /// Export `kernel.*`
    #[serde(default = "enabled")]
    pub kernel: bool,
    /// Export `swap.*`
    #[serde(default = "enabled")]
    pub swap: bool,
    /// Export `nfs.*`
    #[serde(default)]
    pub nfs: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            process: false,
            disk: true,
            file: true,
            memory: true,
            network: true,
            kernel: true,
            swap: true,
            nfs: false,
        }
    }
}

/// Outcome of [`Policy::apply`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    /// Metrics that passed the filter
    pub kept: usize,
    /// Metrics removed, per category
    pub dropped: BTreeMap<Category, usize>,
}

impl Report {
    /// Total number of metrics removed.
    #[must_use]
    pub fn total_dropped(&self) -> usize {
        self.dropped.values().sum()
    }
}

impl Policy {
    /// Whether `category` is exported.
    #[must_use]
    pub fn enabled(&self, category: Category) -> bool {
        match category {
            Category::Process => self.process,
            Category::Disk => self.disk,
            Category::File => self.file,
            Category::Memory => self.memory,
            Category::Network => self.network,
            Category::Kernel => self.kernel,
            Category::Swap => self.swap,
            Category::Nfs => self.nfs,
        }
    }

    /// Keep the metrics this policy allows, preserving order.
    #[must_use]
    pub fn apply(&self, metrics: Vec<String>) -> (Vec<String>, Report) {
        let mut report = Report::default();
        let kept: Vec<String> = metrics
            .into_iter()
            .filter(|metric| match Category::of(metric) {
                Some(category) if !self.enabled(category) => {
                    *report.dropped.entry(category).or_default() += 1;
                    false
                }
                _ => true,
            })
            .collect();
        report.kept = kept.len();
        (kept, report)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn category_is_first_segment_only() {
        assert_eq!(Category::of("disk.dev.read"), Some(Category::Disk));
        assert_eq!(Category::of("filesys.free"), Some(Category::File));
        assert_eq!(Category::of("vfs.files.count"), Some(Category::File));
        assert_eq!(Category::of("diskless.thing"), None);
        assert_eq!(Category::of("hinv.ncpu"), None);
        assert_eq!(Category::of("disk"), None);
    }

    #[test]
    fn defaults_drop_process_and_nfs() {
        let metrics = vec![
            "proc.nprocs".to_string(),
            "nfs.client.calls".to_string(),
            "kernel.all.load".to_string(),
            "proc.psinfo.pid".to_string(),
        ];
        let (kept, report) = Policy::default().apply(metrics);
        assert_eq!(kept, vec!["kernel.all.load".to_string()]);
        assert_eq!(report.kept, 1);
        assert_eq!(report.dropped.get(&Category::Process), Some(&2));
        assert_eq!(report.dropped.get(&Category::Nfs), Some(&1));
        assert_eq!(report.total_dropped(), 3);
    }

    fn metric() -> impl Strategy<Value = String> {
        let segment = prop::sample::select(vec![
            "proc", "disk", "vfs", "filesys", "mem", "network", "kernel", "swap", "nfs", "hinv",
        ]);
        (segment, "[a-z]{1,6}").prop_map(|(s, rest)| format!("{s}.{rest}"))
    }

    fn policy() -> impl Strategy<Value = Policy> {
        prop::array::uniform8(any::<bool>()).prop_map(|b| Policy {
            process: b[0],
            disk: b[1],
            file: b[2],
            memory: b[3],
            network: b[4],
            kernel: b[5],
            swap: b[6],
            nfs: b[7],
        })
    }

    proptest! {
        #[test]
        fn filter_is_order_independent(
            metrics in prop::collection::vec(metric(), 0..64),
            policy in policy(),
            seed in 0usize..64,
        ) {
            let mut shuffled = metrics.clone();
            // Deterministic rotation stands in for a shuffle.
            if !shuffled.is_empty() {
                let len = shuffled.len();
                shuffled.rotate_left(seed % len);
                shuffled.reverse();
            }

            let (mut a, report_a) = policy.apply(metrics);
            let (mut b, report_b) = policy.apply(shuffled);
            a.sort();
            b.sort();
            prop_assert_eq!(a, b);
            prop_assert_eq!(report_a, report_b);
        }

        #[test]
        fn filter_is_idempotent(
            metrics in prop::collection::vec(metric(), 0..64),
            policy in policy(),
        ) {
            let (once, _) = policy.apply(metrics);
            let (twice, report) = policy.apply(once.clone());
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(report.total_dropped(), 0);
        }

        #[test]
        fn undotted_names_are_never_filtered(name in "[a-z_]{1,16}", policy in policy()) {
            let (kept, report) = policy.apply(vec![name.clone()]);
            prop_assert_eq!(kept, vec![name]);
            prop_assert_eq!(report.kept, 1);
        }
    }
}
