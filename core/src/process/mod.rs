//! The process-plugin framework.
//!
//! Process plugins enrich flows with protocol-specific state. Each plugin is
//! registered once per worker, receives a compact integer ID, and is invoked
//! at four hook points around the flow cache's update path:
//!
//! - `post_create` — first packet of a flow, after field initialization;
//! - `pre_update` — before accumulators are applied to an existing flow;
//! - `post_update` — after accumulators are applied;
//! - `pre_export` — final opportunity to derive statistics or remove the
//!   plugin's extension before the flow is serialized.
//!
//! Hooks return a [`FlowAction`] that drives the cache's control flow.
//! Plugins own per-flow state as [`FlowExt`] extension records stored on the
//! flow, tagged and indexed by plugin ID. Hooks must not retain references
//! to the packet descriptor past the hook return and must not call back
//! into the flow cache.

pub mod basicplus;
pub mod dns;
pub mod flow_hash;
pub mod icmp;
pub mod idpcontent;
pub mod mpls;
pub mod nettisa;
pub mod ovpn;
pub mod passivedns;
pub mod phists;
pub mod pstats;
pub mod qinq;
pub mod ssadetector;
pub mod vlan;
pub mod wg;

use crate::export::template::TemplateField;
use crate::flowtable::flow::Flow;
use crate::parser::packet::Packet;
use crate::utils::options::PluginSpec;

use std::any::Any;
use std::fmt::Debug;

use anyhow::{bail, Result};

/// Compact plugin identifier assigned at registration; used as the
/// extension tag on flow records.
pub type PluginId = usize;

/// Result of a plugin hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowAction {
    /// Proceed to the next plugin.
    #[default]
    Continue,
    /// Abort the remaining hooks and export the flow immediately.
    Flush,
    /// Export the flow, then treat the current packet as the first packet
    /// of a new flow with the same 5-tuple.
    FlushWithReinsert,
    /// The plugin declines further packets of this flow; its remaining hook
    /// invocations are skipped for this flow only.
    NoData,
}

/// A per-flow extension record owned by exactly one flow.
///
/// Extensions live from the hook that adds them until the flow is
/// destroyed (exported or evicted).
pub trait FlowExt: Debug {
    /// Serializes the record into `buf` using the plugin's IPFIX field
    /// layout. Returns the number of bytes written, or `None` when `buf`
    /// is too small ("no room"; the exporter flushes and retries once).
    fn fill_ipfix(&self, buf: &mut [u8]) -> Option<usize>;

    /// Renders the record as `key=value` pairs for the text output.
    fn get_text(&self) -> String;

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// A protocol analyzer invoked by the flow cache.
///
/// All hooks default to [`FlowAction::Continue`]; plugins implement only
/// the ones they need. Plugins are per-worker and hold no cross-worker
/// state.
pub trait ProcessPlugin {
    /// Plugin name as used in configuration.
    fn name(&self) -> &'static str;

    /// The registration-assigned plugin ID.
    fn id(&self) -> PluginId;

    /// Ordered IPFIX field descriptors for this plugin's extension.
    fn ipfix_template(&self) -> &'static [TemplateField];

    /// First packet of a new flow.
    fn post_create(&mut self, _flow: &mut Flow, _pkt: &Packet) -> FlowAction {
        FlowAction::Continue
    }

    /// Existing flow, before accumulators are applied.
    fn pre_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> FlowAction {
        FlowAction::Continue
    }

    /// Existing flow, after accumulators are applied.
    fn post_update(&mut self, _flow: &mut Flow, _pkt: &Packet) -> FlowAction {
        FlowAction::Continue
    }

    /// Flow is about to be exported.
    fn pre_export(&mut self, _flow: &mut Flow) {}

    /// Worker shutdown; `print_stats` requests a summary log line.
    fn finish(&mut self, _print_stats: bool) {}
}

/// The per-worker set of process plugins, in deterministic registration
/// order. Write-once at startup, exclusively owned by the worker at
/// runtime.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn ProcessPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        PluginRegistry { plugins: Vec::new() }
    }

    /// Registers one plugin; the constructor receives the assigned ID.
    pub fn register<F>(&mut self, ctor: F)
    where
        F: FnOnce(PluginId) -> Box<dyn ProcessPlugin>,
    {
        let id = self.plugins.len();
        self.plugins.push(ctor(id));
    }

    /// Builds a registry from `name:opt=val;...` plugin specifications.
    ///
    /// Registration order is the order of `specs`, which fixes both hook
    /// invocation order and IPFIX serialization order.
    pub fn from_specs(specs: &[PluginSpec]) -> Result<Self> {
        let mut registry = PluginRegistry::new();
        for spec in specs {
            let spec = spec.clone();
            match spec.name.as_str() {
                "basicplus" => registry.register(|id| Box::new(basicplus::BasicPlusPlugin::new(id))),
                "dns" => registry.register(|id| Box::new(dns::DnsPlugin::new(id))),
                "flow_hash" => registry.register(|id| Box::new(flow_hash::FlowHashPlugin::new(id))),
                "icmp" => registry.register(|id| Box::new(icmp::IcmpPlugin::new(id))),
                "idpcontent" => {
                    registry.register(|id| Box::new(idpcontent::IdpContentPlugin::new(id)))
                }
                "mpls" => registry.register(|id| Box::new(mpls::MplsPlugin::new(id))),
                "nettisa" => registry.register(|id| Box::new(nettisa::NettisaPlugin::new(id))),
                "ovpn" => registry.register(|id| Box::new(ovpn::OvpnPlugin::new(id))),
                "passivedns" => {
                    registry.register(|id| Box::new(passivedns::PassiveDnsPlugin::new(id)))
                }
                "phists" => {
                    registry.register(|id| Box::new(phists::PhistsPlugin::new(id, &spec)))
                }
                "pstats" => {
                    registry.register(|id| Box::new(pstats::PstatsPlugin::new(id, &spec)))
                }
                "qinq" => registry.register(|id| Box::new(qinq::QinQPlugin::new(id))),
                "ssadetector" => {
                    registry.register(|id| Box::new(ssadetector::SsaDetectorPlugin::new(id)))
                }
                "vlan" => registry.register(|id| Box::new(vlan::VlanPlugin::new(id))),
                "wg" => registry.register(|id| Box::new(wg::WgPlugin::new(id))),
                other => bail!("unknown process plugin: {}", other),
            }
        }
        Ok(registry)
    }

    /// Registers every known plugin with default options.
    pub fn register_all() -> Self {
        let specs: Vec<PluginSpec> = [
            "basicplus",
            "dns",
            "flow_hash",
            "icmp",
            "idpcontent",
            "mpls",
            "nettisa",
            "ovpn",
            "passivedns",
            "phists",
            "pstats",
            "qinq",
            "ssadetector",
            "vlan",
            "wg",
        ]
        .iter()
        .map(|name| PluginSpec::parse(name).expect("static plugin name"))
        .collect();
        PluginRegistry::from_specs(&specs).expect("static plugin set")
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Box<dyn ProcessPlugin>> {
        self.plugins.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn ProcessPlugin>> {
        self.plugins.iter_mut()
    }

    /// Invokes `finish` on every plugin at worker shutdown.
    pub fn finish(&mut self, print_stats: bool) {
        for plugin in self.plugins.iter_mut() {
            plugin.finish(print_stats);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_registry_assigns_sequential_ids() {
        let registry = PluginRegistry::register_all();
        assert_eq!(registry.len(), 15);
        for (expect, plugin) in registry.iter().enumerate() {
            assert_eq!(plugin.id(), expect);
        }
        // deterministic order
        assert_eq!(registry.iter().next().unwrap().name(), "basicplus");
    }

    #[test]
    fn core_registry_rejects_unknown_plugin() {
        let spec = PluginSpec::parse("nonexistent").unwrap();
        assert!(PluginRegistry::from_specs(&[spec]).is_err());
    }
}
