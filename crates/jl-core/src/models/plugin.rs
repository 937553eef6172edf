use std::cmp::Ordering;

/// A plugin the coordinator must have before workers can register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: &'static str,
    pub min_version: Option<&'static str>,
}

impl PluginSpec {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            min_version: None,
        }
    }

    pub const fn at_least(name: &'static str, version: &'static str) -> Self {
        Self {
            name,
            min_version: Some(version),
        }
    }

    /// Whether an installed version satisfies this spec.
    pub fn accepts(&self, installed_version: &str) -> bool {
        match self.min_version {
            Some(min) => compare_versions(installed_version, min) != Ordering::Less,
            None => true,
        }
    }
}

/// SSH agents need `ssh-slaves` (the SSH launcher) and the credentials
/// plugins; the rest makes the cluster usable for pipelines.
pub const REQUIRED_PLUGINS: &[PluginSpec] = &[
    PluginSpec::at_least("ssh-slaves", "2.0"),
    PluginSpec::new("ssh-credentials"),
    PluginSpec::new("credentials"),
    PluginSpec::new("workflow-aggregator"),
    PluginSpec::new("git"),
    PluginSpec::new("github"),
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallResult {
    /// Installed by this run.
    pub installed: Vec<String>,
    /// Already present at an acceptable version.
    pub already_present: Vec<String>,
    pub restarted: bool,
}

impl InstallResult {
    pub fn all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .already_present
            .iter()
            .chain(self.installed.iter())
            .cloned()
            .collect();
        names.sort();
        names
    }
}

/// Compare dotted plugin versions numerically, segment by segment.
/// Non-numeric suffixes (`2.0-rc1`, `1.2.3_abc`) are ignored per segment.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.split('.')
            .map(|seg| {
                let digits: String = seg.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (left, right) = (parse(a), parse(b));
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
