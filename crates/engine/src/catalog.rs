//! Preset catalog.
//!
//! Every extraction the bundle can run is declared here, in execution order.
//! This table is the single source of truth for preset names, toolkit
//! functions, output base names and scope membership.

use crate::config::Tool;
use serde::{Deserialize, Serialize};
use tqbundle_common::{Error, Result};

/// Selector value that matches every scope.
pub const EVERYTHING: &str = "everything";
pub const EVERYTHING_LABEL: &str = "Everything";

/// A named triage theme grouping presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    AllEventLogs,
    MftTimeline,
    ApplicationExecution,
    FileFolderOpening,
    DeletedItemsFileExistence,
    BrowserActivity,
    ExternalDeviceUsage,
}

impl Scope {
    /// All scopes in display order.
    pub const ALL: [Scope; 7] = [
        Scope::AllEventLogs,
        Scope::MftTimeline,
        Scope::ApplicationExecution,
        Scope::FileFolderOpening,
        Scope::DeletedItemsFileExistence,
        Scope::BrowserActivity,
        Scope::ExternalDeviceUsage,
    ];

    /// Canonical selector value.
    pub fn value(&self) -> &'static str {
        match self {
            Scope::AllEventLogs => "all_event_logs",
            Scope::MftTimeline => "mft_timeline",
            Scope::ApplicationExecution => "application_execution",
            Scope::FileFolderOpening => "file_folder_opening",
            Scope::DeletedItemsFileExistence => "deleted_items_file_existence",
            Scope::BrowserActivity => "browser_activity",
            Scope::ExternalDeviceUsage => "external_device_usage",
        }
    }

    /// Human-readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Scope::AllEventLogs => "All event logs",
            Scope::MftTimeline => "MFT timeline",
            Scope::ApplicationExecution => "Application execution",
            Scope::FileFolderOpening => "File & folder opening",
            Scope::DeletedItemsFileExistence => "Deleted items & file existence",
            Scope::BrowserActivity => "Browser activity",
            Scope::ExternalDeviceUsage => "External device & USB usage",
        }
    }

    /// Shorthand spellings accepted on input.
    pub fn aliases(&self) -> &'static [&'static str] {
        match self {
            Scope::AllEventLogs => &["all-event-logs", "evtx", "event_logs", "eventlogs"],
            Scope::MftTimeline => &["mft", "mft-timeline"],
            Scope::ApplicationExecution => &["application", "application-execution", "execution"],
            Scope::FileFolderOpening => &["file", "file-folder", "file_folder", "file-folder-opening"],
            Scope::DeletedItemsFileExistence => &[
                "deleted",
                "deleted-items",
                "deleted_items",
                "file-existence",
            ],
            Scope::BrowserActivity => &["browser", "browser-activity"],
            Scope::ExternalDeviceUsage => &[
                "external",
                "external-device",
                "external_device",
                "usb",
                "usb-usage",
                "usb_usage",
            ],
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.value())
    }
}

/// One element of a preset's command template.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arg {
    Literal(&'static str),
    /// Path of the evidence image (or its mountpoint).
    Evidence,
    /// The preset's toolkit function.
    Function,
    /// Every path of the run's rule bundle, in order.
    RuleFiles,
}

/// `<evidence> -f <function>`
pub const FUNCTION_TEMPLATE: &[Arg] = &[Arg::Evidence, Arg::Literal("-f"), Arg::Function];

/// `<evidence> -f <function> -r <rule>...`
pub const RULE_SCAN_TEMPLATE: &[Arg] = &[
    Arg::Evidence,
    Arg::Literal("-f"),
    Arg::Function,
    Arg::Literal("-r"),
    Arg::RuleFiles,
];

/// A pre-configured extraction.
#[derive(Debug, PartialEq, Eq)]
pub struct Preset {
    pub name: &'static str,
    pub tool: Tool,
    pub function: &'static str,
    pub template: &'static [Arg],
    /// Base name of the artifact, appended to the evidence stem.
    pub output_base: &'static str,
    pub scopes: &'static [Scope],
    /// Converter arguments replacing the configured defaults.
    pub converter_args: Option<&'static [&'static str]>,
}

impl Preset {
    /// Render the argument list for one evidence path.
    pub fn render(&self, evidence: &str, rule_files: &[String]) -> Vec<String> {
        let mut args = Vec::with_capacity(self.template.len() + rule_files.len());
        for arg in self.template {
            match arg {
                Arg::Literal(s) => args.push(s.to_string()),
                Arg::Evidence => args.push(evidence.to_string()),
                Arg::Function => args.push(self.function.to_string()),
                Arg::RuleFiles => args.extend(rule_files.iter().cloned()),
            }
        }
        args
    }

    pub fn in_scope(&self, scope: Scope) -> bool {
        self.scopes.contains(&scope)
    }

    /// Whether this preset consumes the run's rule bundle.
    pub fn uses_rules(&self) -> bool {
        self.template.contains(&Arg::RuleFiles)
    }
}

const fn query(
    name: &'static str,
    function: &'static str,
    output_base: &'static str,
    scopes: &'static [Scope],
) -> Preset {
    Preset {
        name,
        tool: Tool::Query,
        function,
        template: FUNCTION_TEMPLATE,
        output_base,
        scopes,
        converter_args: None,
    }
}

const REMOVABLE_DEVICE_SELECTOR: &str = concat!(
    r#"(r.EventID in [4663,4656,6416] and r.Channel == "Security") "#,
    r#"or (r.EventID in [20001,20003] and r.Channel == "System") "#,
    r#"or (r.EventID in [1006])"#,
);

use Scope::*;

/// Built-in presets in declaration (execution) order.
pub static PRESETS: &[Preset] = &[
    query("All event logs", "evtx", "evtx", &[AllEventLogs]),
    query("Generate a MFT Timeline", "mft.records", "mft_timeline", &[MftTimeline]),
    query("Shimcache", "shimcache", "shimcache", &[ApplicationExecution]),
    query("Task Bar Feature Usage", "featureusage", "featureusage", &[ApplicationExecution]),
    query("Amcache.hve", "amcache", "amcache", &[ApplicationExecution]),
    query("Jump Lists", "jumplist", "jumplist", &[ApplicationExecution]),
    query("Open/Save MRU", "mru.opensave", "mru_opensave", &[FileFolderOpening]),
    query("Recent Files (MRU)", "mru.recentdocs", "mru_recentdocs", &[FileFolderOpening]),
    query(
        "Shortcut (LNK) Files",
        "lnk",
        "lnk",
        &[FileFolderOpening, DeletedItemsFileExistence, ExternalDeviceUsage],
    ),
    query(
        "Shell Bags",
        "shellbags",
        "shellbags",
        &[FileFolderOpening, DeletedItemsFileExistence],
    ),
    query("Office Recent Files", "mru.msoffice", "mru_msoffice", &[FileFolderOpening]),
    query("Office Trust Records", "trusteddocs", "trusteddocs", &[FileFolderOpening]),
    query("Last Visited MRU", "mru", "mru", &[ApplicationExecution]),
    query("RunMRU", "runkeys", "runkeys", &[ApplicationExecution]),
    query(
        "Windows 10 Timeline (ActivitiesCache.db)",
        "activitiescache",
        "activitiescache",
        &[ApplicationExecution],
    ),
    query("BAM/DAM", "bam", "bam", &[ApplicationExecution]),
    query("SRUM (System Resource Usage Monitor)", "sru", "sru", &[ApplicationExecution]),
    query("Prefetch", "prefetch", "prefetch", &[ApplicationExecution]),
    query("CapabilityAccessManager", "cam", "cam", &[ApplicationExecution]),
    query("UserAssist", "userassist", "userassist", &[ApplicationExecution]),
    query("Installed Services", "services", "services", &[ApplicationExecution]),
    query("Recycle Bin", "recyclebin", "recyclebin", &[DeletedItemsFileExistence]),
    query("Thumbcache", "thumbcache", "thumbcache", &[DeletedItemsFileExistence]),
    query(
        "Internet Explorer file:/// History",
        "iexplore.history",
        "iexplore_history",
        &[DeletedItemsFileExistence],
    ),
    query("Search - WordWheelQuery", "mru.acmru", "mru_acmru", &[DeletedItemsFileExistence]),
    query("USB history (registry)", "usb", "usb", &[ExternalDeviceUsage]),
    Preset {
        name: "Removable device activity",
        tool: Tool::Query,
        function: "evtx",
        template: FUNCTION_TEMPLATE,
        output_base: "evtx_removable_devices",
        scopes: &[ExternalDeviceUsage],
        converter_args: Some(&["-C", "--multi-timestamp", "-s", REMOVABLE_DEVICE_SELECTOR]),
    },
    query("Browser (all below)", "browser", "browser", &[BrowserActivity]),
    query("Browser Cookies", "browser.cookies", "browser_cookies", &[BrowserActivity]),
    query("Browser Downloads", "browser.downloads", "browser_downloads", &[BrowserActivity]),
    query("Browser Extensions", "browser.extensions", "browser_extensions", &[BrowserActivity]),
    query("Browser History", "browser.history", "browser_history", &[BrowserActivity]),
    query("Browser Passwords", "browser.passwords", "browser_passwords", &[BrowserActivity]),
];

/// Synthetic preset added when the run carries a rule bundle.
pub static RULE_SCAN: Preset = Preset {
    name: "Yara (custom rule)",
    tool: Tool::Query,
    function: "yara",
    template: RULE_SCAN_TEMPLATE,
    output_base: "yara",
    scopes: &[],
    converter_args: None,
};

/// Standard survey recipe re-invoked for its record stream.
pub static SURVEY_RECORDS: Preset = Preset {
    name: "Target info (records)",
    tool: Tool::Info,
    function: "target-info",
    template: &[Arg::Evidence, Arg::Literal("-r")],
    output_base: "target-info",
    scopes: &[],
    converter_args: None,
};

/// Immutable view over a preset table.
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    presets: &'static [Preset],
}

impl Default for Catalog {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Catalog {
    /// The built-in catalog.
    pub const fn builtin() -> Self {
        Self { presets: PRESETS }
    }

    /// All presets in declaration order.
    pub fn presets(&self) -> &'static [Preset] {
        self.presets
    }

    /// Find a preset by display name or output base name (case-insensitive).
    pub fn lookup(&self, name: &str) -> Result<&'static Preset> {
        let wanted = name.trim();
        self.presets
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(wanted) || p.output_base.eq_ignore_ascii_case(wanted))
            .ok_or_else(|| Error::UnknownPreset(name.to_string()))
    }

    /// Presets tagged with `scope`, in declaration order.
    pub fn presets_in_scope(&self, scope: Scope) -> Vec<&'static Preset> {
        self.presets.iter().filter(|p| p.in_scope(scope)).collect()
    }

    /// Every preset, in declaration order.
    pub fn everything(&self) -> Vec<&'static Preset> {
        self.presets.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_names_and_outputs_unique() {
        let names: HashSet<_> = PRESETS.iter().map(|p| p.name).collect();
        let outputs: HashSet<_> = PRESETS.iter().map(|p| p.output_base).collect();
        assert_eq!(names.len(), PRESETS.len());
        assert_eq!(outputs.len(), PRESETS.len());
        assert!(!outputs.contains(RULE_SCAN.output_base));
    }

    #[test]
    fn test_every_scope_has_presets() {
        let catalog = Catalog::builtin();
        for scope in Scope::ALL {
            assert!(
                !catalog.presets_in_scope(scope).is_empty(),
                "scope {} is empty",
                scope
            );
        }
    }

    #[test]
    fn test_everything_is_union_of_scopes() {
        let catalog = Catalog::builtin();
        let mut union: HashSet<&str> = HashSet::new();
        for scope in Scope::ALL {
            union.extend(catalog.presets_in_scope(scope).iter().map(|p| p.name));
        }
        assert_eq!(union.len(), catalog.everything().len());
    }

    #[test]
    fn test_lookup() {
        let catalog = Catalog::builtin();
        assert_eq!(catalog.lookup("Prefetch").unwrap().function, "prefetch");
        assert_eq!(catalog.lookup("mft_timeline").unwrap().function, "mft.records");
        assert!(matches!(
            catalog.lookup("Pagefile"),
            Err(Error::UnknownPreset(_))
        ));
    }

    #[test]
    fn test_render_templates() {
        let evtx = Catalog::builtin().lookup("evtx").unwrap();
        assert_eq!(
            evtx.render("/cases/disk.E01", &[]),
            vec!["/cases/disk.E01", "-f", "evtx"]
        );

        let rules = vec!["/tmp/a.yar".to_string(), "/rules/dir".to_string()];
        assert!(RULE_SCAN.uses_rules());
        assert_eq!(
            RULE_SCAN.render("/cases/disk.E01", &rules),
            vec!["/cases/disk.E01", "-f", "yara", "-r", "/tmp/a.yar", "/rules/dir"]
        );
        assert!(!evtx.uses_rules());
    }

    #[test]
    fn test_removable_devices_overrides_converter() {
        let preset = Catalog::builtin().lookup("Removable device activity").unwrap();
        let args = preset.converter_args.unwrap();
        assert_eq!(args[2], "-s");
        assert!(args[3].contains("r.EventID in [1006]"));
    }
}
