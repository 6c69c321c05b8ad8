//! Serialization and Persistence
//!
//! Patches are stored as JSON in the layout Rack patches use:
//!
//! ```json
//! {
//!   "version": "0.1.0",
//!   "modules": [
//!     { "id": 12, "plugin": "Core", "model": "Gain",
//!       "params": [{ "id": 0, "value": 1.5 }], "bypass": false,
//!       "leftModuleId": 7, "data": { ... } }
//!   ],
//!   "cables": [
//!     { "id": 3, "outputModuleId": 7, "outputId": 0,
//!       "inputModuleId": 12, "inputId": 0, "color": "#f3374b" }
//!   ]
//! }
//! ```
//!
//! Loading is forgiving: unknown modules, malformed entries and cables that
//! fail validation are skipped, logged and counted in a [`LoadReport`].
//! Old patches without module or cable ids (the array index stands in, and
//! cables then refer to module indices) and with `"wires"` instead of
//! `"cables"` still load.

use crate::cable::Cable;
use crate::engine::Engine;
use crate::error::EngineError;
use crate::graph::Graph;
use crate::host::HostContext;
use crate::module::{ExpanderSide, GraphModule, Module, ModuleConfig};
use crate::modules::{Gain, Mixer, Offset};
use crate::param::ParamId;
use crate::terminal::{HostAudio, HostMidi, HostParameters, HostParametersMap, HostTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Serializable patch definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchDef {
    /// Version of the crate that wrote the patch
    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub modules: Vec<ModuleDef>,

    #[serde(default, alias = "wires")]
    pub cables: Vec<Cable>,
}

impl PatchDef {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// One param value; patches without ids use the array index
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamDef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<ParamId>,
    pub value: f32,
}

/// Serializable module instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleDef {
    /// Missing in old patches, where the array index is the id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,

    pub plugin: String,
    pub model: String,

    #[serde(default)]
    pub params: Vec<ParamDef>,

    #[serde(default)]
    pub bypass: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left_module_id: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right_module_id: Option<i64>,

    /// Module-specific state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ModuleDef {
    pub fn new(plugin: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: None,
            plugin: plugin.into(),
            model: model.into(),
            params: Vec::new(),
            bypass: false,
            left_module_id: None,
            right_module_id: None,
            data: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_param(mut self, id: ParamId, value: f32) -> Self {
        self.params.push(ParamDef {
            id: Some(id),
            value,
        });
        self
    }

    fn from_module(module: &Module) -> Self {
        let io = module.io();
        Self {
            id: module.id(),
            plugin: module.plugin().to_string(),
            model: module.model().to_string(),
            params: io
                .params()
                .iter()
                .enumerate()
                .map(|(id, param)| ParamDef {
                    id: Some(id),
                    value: param.value(),
                })
                .collect(),
            bypass: module.is_bypassed(),
            left_module_id: io.left_expander.module_id(),
            right_module_id: io.right_expander.module_id(),
            data: module.processor().data_to_json(),
        }
    }
}

/// What a patch load kept and what it dropped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub modules_loaded: usize,
    pub modules_skipped: usize,
    pub cables_loaded: usize,
    pub cables_skipped: usize,
}

impl LoadReport {
    /// Everything in the patch was loaded
    pub fn is_complete(&self) -> bool {
        self.modules_skipped == 0 && self.cables_skipped == 0
    }
}

/// Module factory function type
pub type ModuleFactory = Box<dyn Fn() -> Box<dyn GraphModule> + Send + Sync>;

/// Metadata about a registered module type
#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    pub plugin: String,
    pub model: String,
    pub name: String,
    pub description: String,
    pub config: ModuleConfig,
}

/// Registry of available module types, keyed by `(plugin, model)` slugs
pub struct ModuleRegistry {
    factories: HashMap<(String, String), ModuleFactory>,
    metadata: HashMap<(String, String), ModuleMetadata>,
}

impl ModuleRegistry {
    /// A registry holding the `"Core"` modules
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register_builtin();
        registry
    }

    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    fn register_builtin(&mut self) {
        self.register_factory("Offset", "Constant voltage, or voltage added to the input", || {
            Box::new(Offset::new())
        });
        self.register_factory("Gain", "Polyphonic amplifier", || Box::new(Gain::new()));
        self.register_factory("Mixer", "4-input polyphonic summing mixer", || {
            Box::new(Mixer::new())
        });
    }

    /// Register the host boundary modules, all bound to `host`
    pub fn register_host_modules(&mut self, host: &Arc<HostContext>) {
        let h = Arc::clone(host);
        self.register_factory("Audio 2", "Stereo host audio in and out", move || {
            Box::new(HostAudio::stereo(Arc::clone(&h)))
        });
        let h = Arc::clone(host);
        self.register_factory("Audio 8", "8-channel host audio in and out", move || {
            Box::new(HostAudio::new(Arc::clone(&h), 8))
        });
        let h = Arc::clone(host);
        self.register_factory("Host Parameters", "Host automation as voltages", move || {
            Box::new(HostParameters::new(Arc::clone(&h)))
        });
        let h = Arc::clone(host);
        self.register_factory(
            "Host Parameters Map",
            "Host automation mapped onto module params",
            move || Box::new(HostParametersMap::new(Arc::clone(&h))),
        );
        let h = Arc::clone(host);
        self.register_factory("Host Time", "Transport gates and clock triggers", move || {
            Box::new(HostTime::new(Arc::clone(&h)))
        });
        let h = Arc::clone(host);
        self.register_factory("Host MIDI", "Monophonic MIDI to CV", move || {
            Box::new(HostMidi::new(Arc::clone(&h)))
        });
    }

    /// Register a module factory; slugs are taken from the module's config
    pub fn register_factory<F>(&mut self, name: &str, description: &str, factory: F)
    where
        F: Fn() -> Box<dyn GraphModule> + Send + Sync + 'static,
    {
        // Get the config from a temporary instance
        let config = factory().config();
        let key = (config.plugin.clone(), config.model.clone());
        self.factories.insert(key.clone(), Box::new(factory));
        self.metadata.insert(
            key,
            ModuleMetadata {
                plugin: config.plugin.clone(),
                model: config.model.clone(),
                name: name.to_string(),
                description: description.to_string(),
                config,
            },
        );
    }

    /// Instantiate a module by slug
    pub fn instantiate(&self, plugin: &str, model: &str) -> Option<Module> {
        self.factories
            .get(&(plugin.to_string(), model.to_string()))
            .map(|f| Module::from_boxed(f()))
    }

    pub fn list_modules(&self) -> impl Iterator<Item = &ModuleMetadata> {
        self.metadata.values()
    }

    pub fn get_metadata(&self, plugin: &str, model: &str) -> Option<&ModuleMetadata> {
        self.metadata.get(&(plugin.to_string(), model.to_string()))
    }

    pub fn list_by_plugin<'a>(
        &'a self,
        plugin: &'a str,
    ) -> impl Iterator<Item = &'a ModuleMetadata> {
        self.metadata.values().filter(move |m| m.plugin == plugin)
    }

    /// All plugin slugs, sorted
    pub fn plugins(&self) -> Vec<String> {
        let mut plugins: Vec<_> = self.metadata.values().map(|m| m.plugin.clone()).collect();
        plugins.sort();
        plugins.dedup();
        plugins
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Patch persistence for the engine
impl Engine {
    /// Snapshot the patch. Call [`Engine::prepare_save`] first to let
    /// modules flush state into their `data`.
    pub fn to_def(&self) -> PatchDef {
        let graph = self.read();
        let modules = graph
            .module_ids()
            .filter_map(|id| graph.slot_by_id(id))
            .map(|slot| ModuleDef::from_module(&slot.module.lock()))
            .collect();
        let cables = graph.cables().cloned().collect();

        PatchDef {
            version: env!("CARGO_PKG_VERSION").to_string(),
            modules,
            cables,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        self.to_def().to_json()
    }

    /// Replace the current patch with the one in `json`
    ///
    /// The engine is only cleared once the document has parsed. Individual
    /// bad entries are skipped; see [`LoadReport`].
    pub fn from_json(&self, json: &str, registry: &ModuleRegistry) -> Result<LoadReport, EngineError> {
        let root: Value =
            serde_json::from_str(json).map_err(|e| EngineError::InvalidPatch(e.to_string()))?;
        self.load_value(&root, registry)
    }

    pub fn load_def(&self, def: &PatchDef, registry: &ModuleRegistry) -> Result<LoadReport, EngineError> {
        let root =
            serde_json::to_value(def).map_err(|e| EngineError::InvalidPatch(e.to_string()))?;
        self.load_value(&root, registry)
    }

    fn load_value(&self, root: &Value, registry: &ModuleRegistry) -> Result<LoadReport, EngineError> {
        let root = root
            .as_object()
            .ok_or_else(|| EngineError::InvalidPatch("patch root is not an object".into()))?;
        let empty = Vec::new();
        let modules = match root.get("modules") {
            Some(Value::Array(modules)) => modules,
            None => &empty,
            Some(_) => return Err(EngineError::InvalidPatch("\"modules\" is not an array".into())),
        };
        let cables = match root.get("cables").or_else(|| root.get("wires")) {
            Some(Value::Array(cables)) => cables,
            None => &empty,
            Some(_) => return Err(EngineError::InvalidPatch("\"cables\" is not an array".into())),
        };

        let mut graph = self.write();
        graph.clear();

        let mut report = LoadReport::default();
        // patch id -> engine id, and each loaded module's expander ids
        let mut ids = HashMap::new();
        let mut expanders = Vec::new();

        for (index, entry) in modules.iter().enumerate() {
            let def: ModuleDef = match serde_json::from_value(entry.clone()) {
                Ok(def) => def,
                Err(e) => {
                    warn!(index, error = %e, "skipping malformed module");
                    report.modules_skipped += 1;
                    continue;
                }
            };
            let patch_id = def.id.unwrap_or(index as i64);
            match load_module(&mut graph, &def, patch_id, registry) {
                Some(id) => {
                    // a duplicated patch id keeps its first module
                    ids.entry(patch_id).or_insert(id);
                    expanders.push((id, def.left_module_id, def.right_module_id));
                    report.modules_loaded += 1;
                }
                None => report.modules_skipped += 1,
            }
        }

        // patch ids of skipped modules resolve to nothing
        let resolve = |id: i64| ids.get(&id).copied();
        for (id, left, right) in expanders {
            for (side, neighbour) in [(ExpanderSide::Left, left), (ExpanderSide::Right, right)] {
                let Some(neighbour) = neighbour else {
                    continue;
                };
                let Some(resolved) = resolve(neighbour) else {
                    warn!(module_id = id, neighbour, "dropping expander link to missing module");
                    continue;
                };
                if let Err(e) = graph.set_module_expander(id, side, Some(resolved)) {
                    warn!(module_id = id, error = %e, "dropping expander link");
                }
            }
        }

        for (index, entry) in cables.iter().enumerate() {
            let mut cable: Cable = match serde_json::from_value(entry.clone()) {
                Ok(cable) => cable,
                Err(e) => {
                    warn!(index, error = %e, "skipping malformed cable");
                    report.cables_skipped += 1;
                    continue;
                }
            };
            let (Some(output_module_id), Some(input_module_id)) =
                (resolve(cable.output_module_id), resolve(cable.input_module_id))
            else {
                warn!(
                    index,
                    output_module_id = cable.output_module_id,
                    input_module_id = cable.input_module_id,
                    "skipping cable to missing module"
                );
                report.cables_skipped += 1;
                continue;
            };
            cable.output_module_id = output_module_id;
            cable.input_module_id = input_module_id;
            cable.id = cable.id.or(Some(index as i64));
            match graph.add_cable(cable) {
                Ok(_) => report.cables_loaded += 1,
                Err(e) => {
                    warn!(index, error = %e, "skipping cable");
                    report.cables_skipped += 1;
                }
            }
        }

        debug!(?report, "patch loaded");
        Ok(report)
    }
}

fn load_module(graph: &mut Graph, def: &ModuleDef, patch_id: i64, registry: &ModuleRegistry) -> Option<i64> {
    let Some(mut module) = registry.instantiate(&def.plugin, &def.model) else {
        warn!(plugin = %def.plugin, model = %def.model, "skipping unknown module");
        return None;
    };

    let num_params = module.io().params().len();
    for (index, param) in def.params.iter().enumerate() {
        let id = param.id.unwrap_or(index);
        if id < num_params {
            module.io_mut().set_param(id, param.value);
        } else {
            warn!(module_id = patch_id, param_id = id, "ignoring unknown param");
        }
    }
    module.set_bypassed_flag(def.bypass);

    if let Some(data) = &def.data {
        if let Err(e) = module.processor_mut().data_from_json(data) {
            warn!(module_id = patch_id, error = %e, "skipping module with bad data");
            return None;
        }
    }

    match graph.add_module(module.with_id(patch_id)) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(module_id = patch_id, error = %e, "skipping module");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HostConfig;
    use approx::assert_relative_eq;
    use serde_json::json;

    fn core_patch(engine: &Engine) -> (i64, i64, i64) {
        let offset = engine.add_module(Module::new(Offset::new())).unwrap();
        let gain = engine.add_module(Module::new(Gain::new())).unwrap();
        let mixer = engine.add_module(Module::new(Mixer::new())).unwrap();
        engine.set_param_value(offset, 0, 2.0).unwrap();
        engine.set_param_value(gain, 0, 1.5).unwrap();
        engine
            .add_cable(Cable::new(offset, 0, gain, 0).with_color("#0986ad"))
            .unwrap();
        engine.add_cable(Cable::new(gain, 0, mixer, 2)).unwrap();
        engine
            .set_module_expander(gain, ExpanderSide::Right, Some(mixer))
            .unwrap();
        (offset, gain, mixer)
    }

    #[test]
    fn test_patch_roundtrip() {
        let registry = ModuleRegistry::new();
        let engine = Engine::new(48000.0);
        let (_, gain, mixer) = core_patch(&engine);
        let json = engine.to_json().unwrap();

        let loaded = Engine::new(48000.0);
        let report = loaded.from_json(&json, &registry).unwrap();
        assert!(report.is_complete());
        assert_eq!(report.modules_loaded, 3);
        assert_eq!(report.cables_loaded, 2);

        // same ids, same cables, same params, same links
        let original: Value = serde_json::from_str(&json).unwrap();
        let reloaded: Value = serde_json::from_str(&loaded.to_json().unwrap()).unwrap();
        assert_eq!(original, reloaded);
        assert_eq!(loaded.module_order(), engine.module_order());

        loaded.step_block(4);
        let mixed = loaded
            .with_module(mixer, |m| m.io().input(2).voltage(0))
            .unwrap();
        assert_relative_eq!(mixed, 3.0);
        let link = loaded.with_module(gain, |m| m.io().right_expander.is_linked());
        assert_eq!(link, Some(true));
    }

    #[test]
    fn test_load_replaces_existing_patch() {
        let registry = ModuleRegistry::new();
        let engine = Engine::new(48000.0);
        core_patch(&engine);
        let json = engine.to_json().unwrap();
        engine.add_module(Module::new(Offset::new())).unwrap();
        assert_eq!(engine.num_modules(), 4);

        engine.from_json(&json, &registry).unwrap();
        assert_eq!(engine.num_modules(), 3);
        assert_eq!(engine.num_cables(), 2);
    }

    #[test]
    fn test_legacy_index_ids_and_wires() {
        let registry = ModuleRegistry::new();
        let engine = Engine::new(48000.0);
        let patch = json!({
            "modules": [
                { "plugin": "Core", "model": "Offset", "params": [{ "value": 4.0 }] },
                { "plugin": "Core", "model": "Gain", "params": [{ "value": 0.5 }] },
                { "plugin": "Core", "model": "Mixer" }
            ],
            "wires": [
                { "outputModuleId": 0, "outputId": 0, "inputModuleId": 1, "inputId": 0 },
                { "outputModuleId": 1, "outputId": 0, "inputModuleId": 2, "inputId": 1 }
            ]
        });
        let report = engine.from_json(&patch.to_string(), &registry).unwrap();
        assert!(report.is_complete());
        assert_eq!(engine.module_ids(), vec![0, 1, 2]);
        assert_eq!(engine.param_value(0, 0), Some(4.0));
        let mut cable_ids = engine.cable_ids();
        cable_ids.sort();
        assert_eq!(cable_ids, vec![0, 1]);
        assert_eq!(engine.get_cable(1).map(|c| c.input_id), Some(1));

        engine.step_block(1);
        let out = engine.with_module(1, |m| m.io().output(0).voltage(0)).unwrap();
        assert_relative_eq!(out, 2.0);
    }

    #[test]
    fn test_bad_entries_are_skipped() {
        let registry = ModuleRegistry::new();
        let engine = Engine::new(48000.0);
        let patch = json!({
            "modules": [
                { "id": 1, "plugin": "Core", "model": "Offset" },
                { "id": 2, "plugin": "Nope", "model": "Missing" },
                { "id": 3, "model": "no plugin" },
                { "id": 4, "plugin": "Core", "model": "Gain", "bypass": true }
            ],
            "cables": [
                { "id": 10, "outputModuleId": 1, "outputId": 0, "inputModuleId": 4, "inputId": 0 },
                { "id": 11, "outputModuleId": 2, "outputId": 0, "inputModuleId": 4, "inputId": 0 },
                { "id": 12, "outputModuleId": 1, "outputId": 0, "inputModuleId": 4, "inputId": 0 },
                { "id": 13, "outputModuleId": 1 }
            ]
        });
        let report = engine.from_json(&patch.to_string(), &registry).unwrap();
        assert_eq!(
            report,
            LoadReport {
                modules_loaded: 2,
                modules_skipped: 2,
                cables_loaded: 1,
                cables_skipped: 3,
            }
        );
        assert_eq!(engine.cable_ids(), vec![10]);
        assert_eq!(engine.is_module_bypassed(4), Some(true));
    }

    #[test]
    fn test_invalid_documents() {
        let registry = ModuleRegistry::new();
        let engine = Engine::new(48000.0);
        engine.add_module(Module::new(Gain::new())).unwrap();
        assert!(matches!(
            engine.from_json("{ not json", &registry),
            Err(EngineError::InvalidPatch(_))
        ));
        assert!(matches!(
            engine.from_json(r#"{ "modules": 3 }"#, &registry),
            Err(EngineError::InvalidPatch(_))
        ));
        // rejected documents leave the patch alone
        assert_eq!(engine.num_modules(), 1);
    }

    #[test]
    fn test_host_modules_keep_data() {
        let host = HostContext::new(&HostConfig::default());
        let mut registry = ModuleRegistry::new();
        registry.register_host_modules(&host);
        assert_eq!(registry.plugins(), vec!["Cardinal".to_string(), "Core".to_string()]);
        assert_eq!(registry.list_by_plugin("Cardinal").count(), 6);

        let engine = Engine::new(48000.0);
        let patch = json!({
            "modules": [
                { "id": 5, "plugin": "Cardinal", "model": "HostAudio2", "data": { "dcFilter": false } },
                { "id": 6, "plugin": "Cardinal", "model": "HostAudio2", "data": { "dcFilter": "yes" } },
                { "id": 7, "plugin": "Cardinal", "model": "HostMIDI" }
            ]
        });
        let report = engine.from_json(&patch.to_string(), &registry).unwrap();
        assert_eq!(report.modules_loaded, 2);
        assert_eq!(report.modules_skipped, 1);

        let saved = engine.to_def();
        let audio = saved.modules.iter().find(|m| m.id == Some(5)).unwrap();
        assert_eq!(audio.data, Some(json!({ "dcFilter": false })));
    }

    #[test]
    fn test_registry_metadata() {
        let registry = ModuleRegistry::default();
        let gain = registry.get_metadata("Core", "Gain").unwrap();
        assert_eq!(gain.name, "Gain");
        assert_eq!(gain.config.params.len(), 1);
        for meta in registry.list_modules() {
            assert!(registry.instantiate(&meta.plugin, &meta.model).is_some());
        }
        assert!(registry.instantiate("Core", "Vco").is_none());
    }

    #[test]
    fn test_patch_def_json() {
        let def = PatchDef {
            version: "0.1.0".into(),
            modules: vec![ModuleDef::new("Core", "Gain").with_id(3).with_param(0, 0.5)],
            cables: vec![Cable::new(3, 0, 3, 0).with_id(9)],
        };
        let json = def.to_json().unwrap();
        assert!(json.contains("\"outputModuleId\": 3"));
        let loaded = PatchDef::from_json(&json).unwrap();
        assert_eq!(loaded.modules, def.modules);
        assert_eq!(loaded.cables, def.cables);

        let engine = Engine::new(48000.0);
        let report = engine.load_def(&loaded, &ModuleRegistry::new()).unwrap();
        assert!(report.is_complete());
        assert_eq!(engine.get_cable(9).map(|c| c.input_module_id), Some(3));
    }

    #[test]
    fn test_links_to_skipped_modules_are_dropped() {
        let registry = ModuleRegistry::new();
        let engine = Engine::new(48000.0);
        let patch = json!({
            "modules": [
                { "id": 1, "plugin": "Core", "model": "Offset", "rightModuleId": 2 },
                { "id": 2, "plugin": "Nope", "model": "Missing" },
                { "id": 3, "plugin": "Core", "model": "Gain", "leftModuleId": 2 }
            ],
            "cables": [
                { "id": 7, "outputModuleId": 2, "outputId": 0, "inputModuleId": 3, "inputId": 0 },
                { "id": 8, "outputModuleId": 1, "outputId": 0, "inputModuleId": 3, "inputId": 0 }
            ]
        });
        let report = engine.from_json(&patch.to_string(), &registry).unwrap();
        assert_eq!(report.modules_skipped, 1);
        assert_eq!(report.cables_loaded, 1);
        assert_eq!(report.cables_skipped, 1);
        assert_eq!(engine.cable_ids(), vec![8]);

        let right = engine.with_module(1, |m| m.io().right_expander.module_id());
        assert_eq!(right, Some(None));
        let left = engine.with_module(3, |m| m.io().left_expander.module_id());
        assert_eq!(left, Some(None));
    }

    #[test]
    fn test_parameter_map_loads_its_mappings() {
        let host = HostContext::new(&HostConfig::default());
        let mut registry = ModuleRegistry::new();
        registry.register_host_modules(&host);

        let engine = Engine::new(48000.0);
        let patch = json!({
            "modules": [
                {
                    "id": 4, "plugin": "Cardinal", "model": "HostParametersMap",
                    "data": { "maps": [
                        { "hostParamId": 255, "inverted": false, "smooth": true, "moduleId": -1, "paramId": 0 },
                        { "hostParamId": 2, "inverted": true, "smooth": false, "moduleId": 9, "paramId": 0 }
                    ] }
                },
                { "id": 9, "plugin": "Core", "model": "Offset" },
                { "id": 5, "plugin": "Cardinal", "model": "HostParametersMap", "data": { "maps": 3 } }
            ]
        });
        let report = engine.from_json(&patch.to_string(), &registry).unwrap();
        assert_eq!(report.modules_loaded, 2);
        assert_eq!(report.modules_skipped, 1);

        // the mapped module came after the map and was back-filled
        let handle = engine.param_handle(9, 0).unwrap();
        assert!(handle.is_resolved());

        let saved = engine.to_def();
        let map = saved.modules.iter().find(|m| m.id == Some(4)).unwrap();
        let maps = &map.data.as_ref().unwrap()["maps"];
        assert_eq!(maps.as_array().map(Vec::len), Some(2));
        assert_eq!(maps[1]["moduleId"], json!(9));
        assert_eq!(maps[1]["hostParamId"], json!(2));
        assert_eq!(maps[1]["inverted"], json!(true));
        assert_eq!(maps[0]["hostParamId"], json!(255));
    }
}
