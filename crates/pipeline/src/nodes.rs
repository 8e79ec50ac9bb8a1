//! Custom-node dependency resolution.
//!
//! Maps the workflow's unregistered class types to installable catalog
//! entries and installs them through the manager, or through the pinned
//! git installer when the caller asked for an exact commit.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use comfyrun_comfyui::api::ComfyUIApiError;
use comfyrun_comfyui::catalog::{CustomNodeEntry, NodeMappings};
use comfyrun_comfyui::events::RunnerEvent;
use comfyrun_comfyui::service::ComfyService;
use comfyrun_core::workflow::Workflow;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::PipelineError;
use crate::node_installer::{repo_dir_name, PinnedNodeInstaller};

// ---------------------------------------------------------------------------
// Policy and inputs
// ---------------------------------------------------------------------------

/// What a failed custom-node install does to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallPolicy {
    /// Log the failure, record it, and keep going.
    #[default]
    BestEffort,
    /// Abort on the first failed install.
    FailFast,
}

impl FromStr for InstallPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "_").as_str() {
            "best_effort" => Ok(Self::BestEffort),
            "fail_fast" => Ok(Self::FailFast),
            other => Err(format!("unknown install policy {other:?}")),
        }
    }
}

/// A caller-supplied custom-node source, optionally pinned to a commit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraNodeSource {
    pub url: String,
    #[serde(default)]
    pub commit_hash: Option<String>,
}

// ---------------------------------------------------------------------------
// Catalog snapshot
// ---------------------------------------------------------------------------

/// Per-run view of what the service has registered and can install.
#[derive(Debug, Clone)]
pub struct NodeTypeCatalog {
    pub registered: HashSet<String>,
    pub entries: Vec<CustomNodeEntry>,
    name_to_url: HashMap<String, String>,
    patterns: Vec<(Regex, String)>,
}

impl NodeTypeCatalog {
    pub fn new(
        registered: HashSet<String>,
        entries: Vec<CustomNodeEntry>,
        mappings: &NodeMappings,
    ) -> Self {
        let patterns = entries
            .iter()
            .filter_map(|entry| {
                let pattern = entry.nodename_pattern.as_deref()?;
                let url = entry.primary_file()?;
                match Regex::new(pattern) {
                    Ok(re) => Some((re, url.to_string())),
                    Err(e) => {
                        tracing::warn!(node = %entry.label(), error = %e, "Ignoring invalid nodename_pattern");
                        None
                    }
                }
            })
            .collect();

        Self {
            registered,
            entries,
            name_to_url: mappings.name_to_url(),
            patterns,
        }
    }

    /// Fresh snapshot from the service.
    pub async fn fetch(service: &dyn ComfyService) -> Result<Self, ComfyUIApiError> {
        let mappings = service.get_node_mappings().await?;
        let entries = service.get_custom_node_list().await?;
        let registered = service.get_registered_nodes().await?;
        Ok(Self::new(registered, entries, &mappings))
    }

    /// Install sources providing `class_type`: the exact mapping if one
    /// exists, otherwise every matching `nodename_pattern`.
    pub fn sources_for(&self, class_type: &str) -> Vec<&str> {
        if let Some(url) = self.name_to_url.get(class_type.trim()) {
            return vec![url.as_str()];
        }
        self.patterns
            .iter()
            .filter(|(re, _)| re.is_match(class_type))
            .map(|(_, url)| url.as_str())
            .collect()
    }
}

/// Catalog entries that provide at least one unregistered class type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MissingNodeSet {
    pub entries: Vec<CustomNodeEntry>,
    /// Unregistered class types no catalog entry provides.
    pub unmatched: Vec<String>,
}

impl MissingNodeSet {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeInstallOutcome {
    AlreadyInstalled { source: String },
    Installed { source: String },
    Failed { source: String, error: String },
}

impl NodeInstallOutcome {
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeInstallReport {
    /// At least one generic or pinned install was attempted.
    pub nodes_installed: bool,
    pub outcomes: Vec<NodeInstallOutcome>,
}

impl NodeInstallReport {
    pub fn failures(&self) -> impl Iterator<Item = &NodeInstallOutcome> {
        self.outcomes.iter().filter(|o| o.is_failure())
    }
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

pub struct NodeDependencyResolver {
    service: Arc<dyn ComfyService>,
    pinned: Arc<dyn PinnedNodeInstaller>,
    custom_nodes_dir: PathBuf,
    policy: InstallPolicy,
    /// Class types known to have no catalog entry yet; looked up in the
    /// name mapping alongside the workflow's own types.
    unresolved: Vec<String>,
    events: broadcast::Sender<RunnerEvent>,
}

impl NodeDependencyResolver {
    pub fn new(
        service: Arc<dyn ComfyService>,
        pinned: Arc<dyn PinnedNodeInstaller>,
        custom_nodes_dir: PathBuf,
        policy: InstallPolicy,
        events: broadcast::Sender<RunnerEvent>,
    ) -> Self {
        Self {
            service,
            pinned,
            custom_nodes_dir,
            policy,
            unresolved: Vec::new(),
            events,
        }
    }

    pub fn with_unresolved(mut self, class_types: Vec<String>) -> Self {
        self.unresolved = class_types;
        self
    }

    /// Catalog entries needed by `workflow` that the service lacks.
    pub fn find_missing(&self, workflow: &Workflow, catalog: &NodeTypeCatalog) -> MissingNodeSet {
        let mut missing_urls: HashSet<&str> = HashSet::new();
        let mut unmatched = Vec::new();

        for node in workflow.nodes() {
            if node.is_composite() || catalog.registered.contains(node.class_type) {
                continue;
            }
            let sources = catalog.sources_for(node.class_type);
            if sources.is_empty() && !unmatched.iter().any(|t: &String| t == node.class_type) {
                unmatched.push(node.class_type.to_string());
            }
            missing_urls.extend(sources);
        }

        for class_type in &self.unresolved {
            if let Some(url) = catalog.name_to_url.get(class_type.as_str()) {
                missing_urls.insert(url.as_str());
            }
        }

        let entries = catalog
            .entries
            .iter()
            .filter(|entry| entry.files.iter().any(|f| missing_urls.contains(f.as_str())))
            .cloned()
            .collect();

        MissingNodeSet { entries, unmatched }
    }

    /// Fetch the catalog, find what `workflow` lacks, and install it
    /// together with the caller's extra sources.
    pub async fn resolve(
        &self,
        workflow: &Workflow,
        extra_sources: &[ExtraNodeSource],
    ) -> Result<NodeInstallReport, PipelineError> {
        let catalog = NodeTypeCatalog::fetch(self.service.as_ref()).await?;
        let missing = self.find_missing(workflow, &catalog);

        for class_type in &missing.unmatched {
            tracing::warn!(class_type = %class_type, "No install source known for node type");
        }
        if !missing.is_empty() {
            tracing::info!(count = missing.entries.len(), "Installing custom nodes");
        }

        self.install(&missing, &catalog, extra_sources).await
    }

    /// Install `missing` plus `extra_sources`.
    ///
    /// Entries whose primary file is pinned by an extra source go to the
    /// pinned installer. A pin that no missing entry needs is not
    /// installed. Already-installed entries are skipped.
    pub async fn install(
        &self,
        missing: &MissingNodeSet,
        catalog: &NodeTypeCatalog,
        extra_sources: &[ExtraNodeSource],
    ) -> Result<NodeInstallReport, PipelineError> {
        let mut pins: Vec<(&str, &str)> = Vec::new();
        for source in extra_sources {
            if let Some(hash) = source.commit_hash.as_deref() {
                if !pins.iter().any(|(url, _)| *url == source.url) {
                    pins.push((source.url.as_str(), hash));
                }
            }
        }

        let mut report = NodeInstallReport::default();
        let mut handled: HashSet<String> = HashSet::new();
        let mut needed_pins: Vec<(&str, &str)> = Vec::new();

        for entry in &missing.entries {
            let source = entry.primary_file().unwrap_or(&entry.reference).to_string();
            if let Some(&pin) = pins.iter().find(|(url, _)| *url == source) {
                if !needed_pins.contains(&pin) {
                    needed_pins.push(pin);
                }
                continue;
            }
            handled.insert(source.clone());
            self.install_generic(entry, source, &mut report).await?;
        }

        for extra in extra_sources.iter().filter(|s| s.commit_hash.is_none()) {
            if !handled.insert(extra.url.clone()) {
                continue;
            }
            let known: Vec<&CustomNodeEntry> = catalog
                .entries
                .iter()
                .filter(|e| e.reference == extra.url || e.primary_file() == Some(extra.url.as_str()))
                .collect();

            if known.is_empty() {
                if self.checkout_exists(&extra.url) {
                    report.outcomes.push(NodeInstallOutcome::AlreadyInstalled {
                        source: extra.url.clone(),
                    });
                    continue;
                }
                let entry = CustomNodeEntry::git_clone(&extra.url);
                self.install_generic(&entry, extra.url.clone(), &mut report).await?;
            } else {
                for entry in known {
                    self.install_generic(entry, extra.url.clone(), &mut report).await?;
                }
            }
        }

        for (url, _) in pins.iter().filter(|pin| !needed_pins.contains(pin)) {
            tracing::debug!(url = %url, "Pinned custom node not needed by this workflow");
        }
        for (url, hash) in needed_pins {
            self.install_pinned(url, hash, &mut report).await?;
        }

        Ok(report)
    }

    fn checkout_exists(&self, url: &str) -> bool {
        repo_dir_name(url).is_some_and(|name| self.custom_nodes_dir.join(name).exists())
    }

    async fn install_generic(
        &self,
        entry: &CustomNodeEntry,
        source: String,
        report: &mut NodeInstallReport,
    ) -> Result<(), PipelineError> {
        if entry.is_installed() {
            tracing::debug!(node = %entry.label(), "Custom node already installed");
            report.outcomes.push(NodeInstallOutcome::AlreadyInstalled { source });
            return Ok(());
        }

        tracing::debug!(node = %entry.label(), "Installing custom node");
        report.nodes_installed = true;
        let result = self.service.install_custom_node(entry).await;
        self.record(source, result.map_err(|e| e.to_string()), report)
    }

    async fn install_pinned(
        &self,
        url: &str,
        commit_hash: &str,
        report: &mut NodeInstallReport,
    ) -> Result<(), PipelineError> {
        tracing::debug!(url = %url, commit = %commit_hash, "Installing pinned custom node");
        report.nodes_installed = true;
        let result = self.pinned.install(url, commit_hash).await;
        self.record(url.to_string(), result.map_err(|e| e.to_string()), report)
    }

    fn record(
        &self,
        source: String,
        result: Result<(), String>,
        report: &mut NodeInstallReport,
    ) -> Result<(), PipelineError> {
        match result {
            Ok(()) => {
                let _ = self.events.send(RunnerEvent::NodeInstalled {
                    source: source.clone(),
                });
                report.outcomes.push(NodeInstallOutcome::Installed { source });
                Ok(())
            }
            Err(error) => {
                tracing::error!(source = %source, error = %error, "Failed to install custom node");
                let _ = self.events.send(RunnerEvent::NodeInstallFailed {
                    source: source.clone(),
                    error: error.clone(),
                });
                report.outcomes.push(NodeInstallOutcome::Failed {
                    source: source.clone(),
                    error: error.clone(),
                });
                match self.policy {
                    InstallPolicy::BestEffort => Ok(()),
                    InstallPolicy::FailFast => Err(PipelineError::DependencyInstallFailed {
                        node: source,
                        error,
                    }),
                }
            }
        }
    }
}
