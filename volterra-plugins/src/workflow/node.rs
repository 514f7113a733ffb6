//! Typed workflow nodes
//!
//! Every node carries exactly one payload shape, selected by its `type` tag.
//! The workflow editor saves nodes as
//! `{"id": "...", "type": "entrypoint", "position": {...}, "data": {"entrypoint": {...}}}`,
//! with the payload under a key named after its type. The flat form
//! `"data": {...}` holding the payload fields directly is accepted too.
//! [`WorkflowNode`] parses `data` against the declared type so a mismatched
//! payload, an unknown field or a payload filed under another type's key is
//! rejected at load time rather than discovered during execution.

use crate::invocation::ArgumentDeclaration;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;

/// Unique identifier of a node within one workflow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node ID from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw identifier
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// The closed set of node kinds a plugin workflow can contain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    /// Plugin identity (name, author, version)
    #[serde(rename = "modifier")]
    Modifier,
    /// User-facing argument declarations
    #[serde(rename = "arguments")]
    Arguments,
    /// Input source selection
    #[serde(rename = "context")]
    Context,
    /// Iteration over the trajectory frames
    #[serde(rename = "foreach", alias = "forEach")]
    ForEach,
    /// The external binary and its argument template
    #[serde(rename = "entrypoint")]
    Entrypoint,
    /// A named output surfaced to clients
    #[serde(rename = "exposure")]
    Exposure,
    /// Result schema definition
    #[serde(rename = "schema")]
    Schema,
    /// Viewer configuration for an exposure
    #[serde(rename = "visualizers")]
    Visualizers,
    /// Export of an exposure to a file format
    #[serde(rename = "export")]
    Export,
    /// Conditional branching
    #[serde(rename = "if-statement")]
    IfStatement,
}

impl NodeType {
    /// All node types, in declaration order
    pub const ALL: [NodeType; 10] = [
        NodeType::Modifier,
        NodeType::Arguments,
        NodeType::Context,
        NodeType::ForEach,
        NodeType::Entrypoint,
        NodeType::Exposure,
        NodeType::Schema,
        NodeType::Visualizers,
        NodeType::Export,
        NodeType::IfStatement,
    ];

    /// The tag used in the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Modifier => "modifier",
            NodeType::Arguments => "arguments",
            NodeType::Context => "context",
            NodeType::ForEach => "foreach",
            NodeType::Entrypoint => "entrypoint",
            NodeType::Exposure => "exposure",
            NodeType::Schema => "schema",
            NodeType::Visualizers => "visualizers",
            NodeType::Export => "export",
            NodeType::IfStatement => "if-statement",
        }
    }

    /// Key the editor files this type's payload under inside `data`
    pub fn envelope_key(&self) -> &'static str {
        match self {
            NodeType::Modifier => "modifier",
            NodeType::Arguments => "arguments",
            NodeType::Context => "context",
            NodeType::ForEach => "forEach",
            NodeType::Entrypoint => "entrypoint",
            NodeType::Exposure => "exposure",
            NodeType::Schema => "schema",
            NodeType::Visualizers => "visualizers",
            NodeType::Export => "export",
            NodeType::IfStatement => "ifStatement",
        }
    }

    /// Human readable name used in validation messages
    pub fn display_name(&self) -> &'static str {
        match self {
            NodeType::Modifier => "Modifier",
            NodeType::Arguments => "Arguments",
            NodeType::Context => "Context",
            NodeType::ForEach => "ForEach",
            NodeType::Entrypoint => "Entrypoint",
            NodeType::Exposure => "Exposure",
            NodeType::Schema => "Schema",
            NodeType::Visualizers => "Visualizers",
            NodeType::Export => "Export",
            NodeType::IfStatement => "IfStatement",
        }
    }

    /// Payload an editor would create for a freshly dropped node of this type
    pub fn default_data(&self) -> NodeData {
        match self {
            NodeType::Modifier => NodeData::Modifier(ModifierData::default()),
            NodeType::Arguments => NodeData::Arguments(ArgumentsData::default()),
            NodeType::Context => NodeData::Context(ContextData::default()),
            NodeType::ForEach => NodeData::ForEach(ForEachData::default()),
            NodeType::Entrypoint => NodeData::Entrypoint(EntrypointData::default()),
            NodeType::Exposure => NodeData::Exposure(ExposureData::default()),
            NodeType::Schema => NodeData::Schema(SchemaData::default()),
            NodeType::Visualizers => NodeData::Visualizers(VisualizersData::default()),
            NodeType::Export => NodeData::Export(ExportData::default()),
            NodeType::IfStatement => NodeData::IfStatement(IfStatementData::default()),
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Plugin identity
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ModifierData {
    /// Plugin name, also the directory the binary lives in
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One user-facing argument, keyed by its CLI flag name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArgumentDefinition {
    /// Flag name, emitted as `--{argument}`
    pub argument: String,
    /// Type, default and option set
    #[serde(flatten)]
    pub declaration: ArgumentDeclaration,
}

/// Ordered argument declarations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgumentsData {
    #[serde(default)]
    pub arguments: Vec<ArgumentDefinition>,
}

impl ArgumentsData {
    /// Declarations keyed by flag name, in declaration order
    ///
    /// A repeated flag name keeps its first position but takes the later
    /// declaration.
    pub fn declarations(&self) -> IndexMap<String, ArgumentDeclaration> {
        self.arguments
            .iter()
            .map(|def| (def.argument.clone(), def.declaration.clone()))
            .collect()
    }
}

/// Where the per-run input comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContextSource {
    /// One input file per trajectory frame
    #[default]
    #[serde(rename = "trajectory-dumps")]
    TrajectoryDumps,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContextData {
    #[serde(default)]
    pub source: ContextSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ForEachData {
    /// Reference to the collection being iterated, e.g. `context.trajectory_dumps`
    #[serde(default)]
    pub iterable_source: String,
}

/// The external binary invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntrypointData {
    /// Binary name or path, relative paths resolve inside the plugin directory
    #[serde(default)]
    pub binary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_object_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary_hash: Option<String>,
    /// Argument template, e.g. `{{ forEach.currentValue }} {{ arguments.as_str }}`
    #[serde(default)]
    pub arguments: String,
    /// Per-run timeout in milliseconds; absent means no timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExposureData {
    #[serde(default)]
    pub name: String,
    /// Result file suffix the binary writes for this exposure
    #[serde(default)]
    pub results: String,
    /// Dot-path selecting the array of interest inside each streamed message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterable: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaData {
    #[serde(default)]
    pub definition: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VisualizersData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canvas: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raster: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub listing: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_atom_properties: Option<Vec<String>>,
}

/// Exporters understood by the rendering pipeline
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Exporter {
    #[default]
    #[serde(rename = "AtomisticExporter")]
    Atomistic,
    #[serde(rename = "MeshExporter")]
    Mesh,
    #[serde(rename = "DislocationExporter")]
    Dislocation,
    #[serde(rename = "ChartExporter")]
    Chart,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportFormat {
    #[default]
    #[serde(rename = "glb")]
    Glb,
    #[serde(rename = "chart-png")]
    ChartPng,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExportData {
    #[serde(default)]
    pub exporter: Exporter,
    #[serde(rename = "type", default)]
    pub format: ExportFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConditionJoin {
    #[default]
    And,
    Or,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionHandler {
    #[default]
    IsEqualTo,
    IsNotEqualTo,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IfStatementCondition {
    #[serde(rename = "type", default)]
    pub join: ConditionJoin,
    pub left_expression: String,
    #[serde(default)]
    pub handler: ConditionHandler,
    pub right_expression: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IfStatementData {
    #[serde(default)]
    pub conditions: Vec<IfStatementCondition>,
}

/// Node payload, one variant per [`NodeType`]
#[derive(Debug, Clone, PartialEq)]
pub enum NodeData {
    Modifier(ModifierData),
    Arguments(ArgumentsData),
    Context(ContextData),
    ForEach(ForEachData),
    Entrypoint(EntrypointData),
    Exposure(ExposureData),
    Schema(SchemaData),
    Visualizers(VisualizersData),
    Export(ExportData),
    IfStatement(IfStatementData),
}

impl NodeData {
    /// The type tag matching this payload
    pub fn node_type(&self) -> NodeType {
        match self {
            NodeData::Modifier(_) => NodeType::Modifier,
            NodeData::Arguments(_) => NodeType::Arguments,
            NodeData::Context(_) => NodeType::Context,
            NodeData::ForEach(_) => NodeType::ForEach,
            NodeData::Entrypoint(_) => NodeType::Entrypoint,
            NodeData::Exposure(_) => NodeType::Exposure,
            NodeData::Schema(_) => NodeType::Schema,
            NodeData::Visualizers(_) => NodeType::Visualizers,
            NodeData::Export(_) => NodeType::Export,
            NodeData::IfStatement(_) => NodeType::IfStatement,
        }
    }

    fn from_value(node_type: NodeType, data: Value) -> Result<Self, String> {
        let data = match data {
            // Editors persist freshly dropped nodes with `data: null`
            Value::Null => Value::Object(Map::new()),
            Value::Object(fields) if is_envelope(&fields) => open_envelope(node_type, fields)?,
            flat => flat,
        };
        let parsed = match node_type {
            NodeType::Modifier => serde_json::from_value(data).map(NodeData::Modifier),
            NodeType::Arguments => serde_json::from_value(data).map(NodeData::Arguments),
            NodeType::Context => serde_json::from_value(data).map(NodeData::Context),
            NodeType::ForEach => serde_json::from_value(data).map(NodeData::ForEach),
            NodeType::Entrypoint => serde_json::from_value(data).map(NodeData::Entrypoint),
            NodeType::Exposure => serde_json::from_value(data).map(NodeData::Exposure),
            NodeType::Schema => serde_json::from_value(data).map(NodeData::Schema),
            NodeType::Visualizers => serde_json::from_value(data).map(NodeData::Visualizers),
            NodeType::Export => serde_json::from_value(data).map(NodeData::Export),
            NodeType::IfStatement => serde_json::from_value(data).map(NodeData::IfStatement),
        };
        parsed.map_err(|e| e.to_string())
    }

    /// Editor form: the payload filed under the type's envelope key
    fn to_value(&self) -> serde_json::Result<Value> {
        let payload = match self {
            NodeData::Modifier(d) => serde_json::to_value(d),
            NodeData::Arguments(d) => serde_json::to_value(d),
            NodeData::Context(d) => serde_json::to_value(d),
            NodeData::ForEach(d) => serde_json::to_value(d),
            NodeData::Entrypoint(d) => serde_json::to_value(d),
            NodeData::Exposure(d) => serde_json::to_value(d),
            NodeData::Schema(d) => serde_json::to_value(d),
            NodeData::Visualizers(d) => serde_json::to_value(d),
            NodeData::Export(d) => serde_json::to_value(d),
            NodeData::IfStatement(d) => serde_json::to_value(d),
        }?;
        let mut envelope = Map::new();
        envelope.insert(self.node_type().envelope_key().to_string(), payload);
        Ok(Value::Object(envelope))
    }
}

/// Whether `data` uses the editor's `{<type key>: {...}}` layout
///
/// Every key must be an envelope key holding an object or null. A flat
/// Arguments payload (`{"arguments": [...]}`) holds an array and so stays flat.
fn is_envelope(fields: &Map<String, Value>) -> bool {
    !fields.is_empty()
        && fields.iter().all(|(key, value)| {
            (value.is_object() || value.is_null())
                && NodeType::ALL.iter().any(|t| t.envelope_key() == key.as_str())
        })
}

fn open_envelope(node_type: NodeType, mut fields: Map<String, Value>) -> Result<Value, String> {
    let own = fields.remove(node_type.envelope_key()).unwrap_or(Value::Null);
    if let Some((key, _)) = fields.iter().find(|(_, value)| !value.is_null()) {
        return Err(format!("unexpected '{}' payload", key));
    }
    Ok(match own {
        Value::Null => Value::Object(Map::new()),
        payload => payload,
    })
}

/// Canvas position, carried through untouched for the editor
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePosition {
    pub x: f64,
    pub y: f64,
}

/// A node in a plugin workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawNode", into = "RawNode")]
pub struct WorkflowNode {
    pub id: NodeId,
    pub position: Option<NodePosition>,
    pub data: NodeData,
}

impl WorkflowNode {
    /// Create a node from its payload
    pub fn new(id: impl Into<NodeId>, data: NodeData) -> Self {
        Self {
            id: id.into(),
            position: None,
            data,
        }
    }

    /// Type tag of this node
    pub fn node_type(&self) -> NodeType {
        self.data.node_type()
    }

    pub fn as_modifier(&self) -> Option<&ModifierData> {
        match &self.data {
            NodeData::Modifier(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_arguments(&self) -> Option<&ArgumentsData> {
        match &self.data {
            NodeData::Arguments(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_entrypoint(&self) -> Option<&EntrypointData> {
        match &self.data {
            NodeData::Entrypoint(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_exposure(&self) -> Option<&ExposureData> {
        match &self.data {
            NodeData::Exposure(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_for_each(&self) -> Option<&ForEachData> {
        match &self.data {
            NodeData::ForEach(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawNode {
    id: NodeId,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    position: Option<NodePosition>,
    #[serde(default)]
    data: Value,
}

impl TryFrom<RawNode> for WorkflowNode {
    type Error = String;

    fn try_from(raw: RawNode) -> Result<Self, Self::Error> {
        let data = NodeData::from_value(raw.node_type, raw.data).map_err(|e| {
            format!(
                "node '{}' has data that does not match type '{}': {}",
                raw.id,
                raw.node_type.as_str(),
                e
            )
        })?;
        Ok(Self {
            id: raw.id,
            position: raw.position,
            data,
        })
    }
}

impl From<WorkflowNode> for RawNode {
    fn from(node: WorkflowNode) -> Self {
        let node_type = node.node_type();
        // Payload structs hold only serializable fields
        let data = node.data.to_value().unwrap_or(Value::Null);
        Self {
            id: node.id,
            node_type,
            position: node.position,
            data,
        }
    }
}
