//! Typed object arena over a loaded `project.pbxproj`.
//!
//! Nodes reference each other only through [`ObjectId`]s held in the object
//! table, so insertion order is explicit: a build file can only wrap a file
//! reference that is already registered, and a build phase only accepts a
//! registered build file.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

use crate::pbxproj::{self, Dict, PlistError, Value};

/// Display name of the group that holds the generated harness.
pub const GENERATED_GROUP_NAME: &str = "TipsyGenerated";

const PROJECT_FILE: &str = "project.pbxproj";

#[derive(Debug, Error)]
pub enum GraphError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: PlistError,
    },
    #[error("malformed project: {0}")]
    Malformed(String),
    #[error("object {id} is not a {expected}")]
    WrongKind { id: ObjectId, expected: &'static str },
    #[error("object {0} is not registered in the object table")]
    UnknownObject(ObjectId),
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectNode {
    pub main_group: ObjectId,
    pub targets: Vec<ObjectId>,
    pub rest: Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupNode {
    pub children: Vec<ObjectId>,
    pub rest: Dict,
}

impl GroupNode {
    pub fn name(&self) -> Option<&str> {
        self.rest
            .get("name")
            .or_else(|| self.rest.get("path"))
            .and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FileReferenceNode {
    pub path: String,
    pub rest: Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildFileNode {
    pub file_ref: ObjectId,
    pub rest: Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildPhaseNode {
    pub files: Vec<ObjectId>,
    pub rest: Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TargetNode {
    pub name: String,
    pub build_phases: Vec<ObjectId>,
    pub rest: Dict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Project(ProjectNode),
    Group(GroupNode),
    FileReference(FileReferenceNode),
    BuildFile(BuildFileNode),
    SourcesBuildPhase(BuildPhaseNode),
    NativeTarget(TargetNode),
    /// Anything this tool never touches, kept verbatim including `isa`.
    Other(Dict),
}

impl Node {
    fn from_dict(mut dict: Dict) -> Result<Node, String> {
        let isa = dict
            .get("isa")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| "object without isa".to_string())?;
        let node = match isa.as_str() {
            "PBXProject" => {
                dict.remove("isa");
                Node::Project(ProjectNode {
                    main_group: take_id(&mut dict, "mainGroup")?,
                    targets: take_ids(&mut dict, "targets")?,
                    rest: dict,
                })
            }
            "PBXGroup" => {
                dict.remove("isa");
                Node::Group(GroupNode {
                    children: take_ids(&mut dict, "children")?,
                    rest: dict,
                })
            }
            "PBXFileReference" if dict.contains_key("path") => {
                dict.remove("isa");
                Node::FileReference(FileReferenceNode {
                    path: take_string(&mut dict, "path")?,
                    rest: dict,
                })
            }
            "PBXBuildFile" if dict.contains_key("fileRef") => {
                dict.remove("isa");
                Node::BuildFile(BuildFileNode {
                    file_ref: take_id(&mut dict, "fileRef")?,
                    rest: dict,
                })
            }
            "PBXSourcesBuildPhase" => {
                dict.remove("isa");
                Node::SourcesBuildPhase(BuildPhaseNode {
                    files: take_ids(&mut dict, "files")?,
                    rest: dict,
                })
            }
            "PBXNativeTarget" => {
                dict.remove("isa");
                Node::NativeTarget(TargetNode {
                    name: take_string(&mut dict, "name")?,
                    build_phases: take_ids(&mut dict, "buildPhases")?,
                    rest: dict,
                })
            }
            _ => Node::Other(dict),
        };
        Ok(node)
    }

    fn to_dict(&self) -> Dict {
        fn with(isa: &str, rest: &Dict, fields: Vec<(&str, Value)>) -> Dict {
            let mut dict = rest.clone();
            dict.insert("isa".to_string(), isa.into());
            for (k, v) in fields {
                dict.insert(k.to_string(), v);
            }
            dict
        }
        match self {
            Node::Project(n) => with(
                "PBXProject",
                &n.rest,
                vec![
                    ("mainGroup", id_value(&n.main_group)),
                    ("targets", ids_value(&n.targets)),
                ],
            ),
            Node::Group(n) => with("PBXGroup", &n.rest, vec![("children", ids_value(&n.children))]),
            Node::FileReference(n) => with(
                "PBXFileReference",
                &n.rest,
                vec![("path", n.path.clone().into())],
            ),
            Node::BuildFile(n) => with("PBXBuildFile", &n.rest, vec![("fileRef", id_value(&n.file_ref))]),
            Node::SourcesBuildPhase(n) => with(
                "PBXSourcesBuildPhase",
                &n.rest,
                vec![("files", ids_value(&n.files))],
            ),
            Node::NativeTarget(n) => with(
                "PBXNativeTarget",
                &n.rest,
                vec![
                    ("name", n.name.clone().into()),
                    ("buildPhases", ids_value(&n.build_phases)),
                ],
            ),
            Node::Other(dict) => dict.clone(),
        }
    }
}

fn take_string(dict: &mut Dict, key: &str) -> Result<String, String> {
    match dict.remove(key) {
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(format!("{} is not a string", key)),
        None => Err(format!("missing {}", key)),
    }
}

fn take_id(dict: &mut Dict, key: &str) -> Result<ObjectId, String> {
    take_string(dict, key).map(ObjectId)
}

fn take_ids(dict: &mut Dict, key: &str) -> Result<Vec<ObjectId>, String> {
    match dict.remove(key) {
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|v| match v {
                Value::String(s) => Ok(ObjectId(s)),
                _ => Err(format!("{} contains a non-identifier", key)),
            })
            .collect(),
        Some(_) => Err(format!("{} is not an array", key)),
        None => Ok(Vec::new()),
    }
}

fn id_value(id: &ObjectId) -> Value {
    Value::String(id.0.clone())
}

fn ids_value(ids: &[ObjectId]) -> Value {
    Value::Array(ids.iter().map(id_value).collect())
}

#[derive(Debug, Clone)]
pub struct ProjectGraph {
    header: Dict,
    root_object: ObjectId,
    objects: BTreeMap<ObjectId, Node>,
    id_counter: u64,
}

impl ProjectGraph {
    /// Loads `<bundle>/project.pbxproj`, or the file itself when given one.
    pub fn load(path: &Path) -> Result<Self, GraphError> {
        let file = project_file(path);
        let text = fs::read_to_string(&file).map_err(|source| GraphError::Read {
            path: file.clone(),
            source,
        })?;
        let root = pbxproj::parse(&text).map_err(|source| GraphError::Parse {
            path: file.clone(),
            source,
        })?;
        let graph = Self::from_value(root)?;
        if graph.is_empty() {
            return Err(GraphError::Malformed(format!(
                "{} has an empty objects table",
                file.display()
            )));
        }
        debug!(path = %file.display(), objects = graph.len(), "project loaded");
        Ok(graph)
    }

    pub fn from_value(root: Value) -> Result<Self, GraphError> {
        let mut header = match root {
            Value::Dict(d) => d,
            _ => return Err(GraphError::Malformed("root is not a dictionary".into())),
        };
        let root_object = match header.remove("rootObject") {
            Some(Value::String(s)) => ObjectId(s),
            _ => return Err(GraphError::Malformed("missing rootObject".into())),
        };
        let raw_objects = match header.remove("objects") {
            Some(Value::Dict(d)) => d,
            _ => return Err(GraphError::Malformed("missing objects table".into())),
        };
        let mut objects = BTreeMap::new();
        for (id, value) in raw_objects {
            let dict = match value {
                Value::Dict(d) => d,
                _ => return Err(GraphError::Malformed(format!("object {} is not a dictionary", id))),
            };
            let node = Node::from_dict(dict)
                .map_err(|e| GraphError::Malformed(format!("object {}: {}", id, e)))?;
            objects.insert(ObjectId(id), node);
        }
        Ok(Self {
            header,
            root_object,
            objects,
            id_counter: 0,
        })
    }

    pub fn to_value(&self) -> Value {
        let mut root = self.header.clone();
        let objects: Dict = self
            .objects
            .iter()
            .map(|(id, node)| (id.0.clone(), Value::Dict(node.to_dict())))
            .collect();
        root.insert("objects".to_string(), Value::Dict(objects));
        root.insert("rootObject".to_string(), id_value(&self.root_object));
        Value::Dict(root)
    }

    /// Writes the graph to `<bundle>/project.pbxproj`, overwriting it.
    pub fn save(&self, path: &Path) -> Result<(), GraphError> {
        let file = project_file(path);
        fs::write(&file, pbxproj::write(&self.to_value())).map_err(|source| GraphError::Write {
            path: file.clone(),
            source,
        })
    }

    pub fn node(&self, id: &ObjectId) -> Option<&Node> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn project(&self) -> Option<&ProjectNode> {
        match self.objects.get(&self.root_object) {
            Some(Node::Project(p)) => Some(p),
            _ => None,
        }
    }

    /// The project's main group, if the project object and group both exist.
    pub fn root_group(&self) -> Option<ObjectId> {
        let main = &self.project()?.main_group;
        match self.objects.get(main) {
            Some(Node::Group(_)) => Some(main.clone()),
            _ => None,
        }
    }

    pub fn group(&self, id: &ObjectId) -> Option<&GroupNode> {
        match self.objects.get(id) {
            Some(Node::Group(g)) => Some(g),
            _ => None,
        }
    }

    /// First native target of the project with this name.
    pub fn find_target(&self, name: &str) -> Option<ObjectId> {
        let project = self.project()?;
        project.targets.iter().find_map(|id| match self.objects.get(id) {
            Some(Node::NativeTarget(t)) if t.name == name => Some(id.clone()),
            _ => None,
        })
    }

    pub fn sources_build_phase(&self, target: &ObjectId) -> Option<ObjectId> {
        let target = match self.objects.get(target) {
            Some(Node::NativeTarget(t)) => t,
            _ => return None,
        };
        target
            .build_phases
            .iter()
            .find(|id| matches!(self.objects.get(*id), Some(Node::SourcesBuildPhase(_))))
            .cloned()
    }

    pub fn build_phase_files(&self, phase: &ObjectId) -> Option<&[ObjectId]> {
        match self.objects.get(phase) {
            Some(Node::SourcesBuildPhase(p)) => Some(&p.files),
            _ => None,
        }
    }

    /// Appends a new named group as the last child of `parent`.
    pub fn add_group(&mut self, parent: &ObjectId, name: &str) -> Result<ObjectId, GraphError> {
        self.expect_group(parent)?;
        let id = self.allocate_id(&format!("group:{}", name));
        let mut rest = Dict::new();
        rest.insert("name".into(), name.into());
        rest.insert("sourceTree".into(), "<group>".into());
        self.objects.insert(
            id.clone(),
            Node::Group(GroupNode {
                children: Vec::new(),
                rest,
            }),
        );
        self.push_child(parent, id.clone())?;
        Ok(id)
    }

    /// Adds a file reference under `group`, stored relative to `source_root`.
    pub fn add_file_reference(
        &mut self,
        group: &ObjectId,
        file: &Path,
        source_root: &Path,
    ) -> Result<ObjectId, GraphError> {
        self.expect_group(group)?;
        let rel = relative_path(file, source_root);
        let rel_str = rel.to_string_lossy().to_string();
        let id = self.allocate_id(&format!("file:{}", rel_str));
        let mut rest = Dict::new();
        rest.insert("sourceTree".into(), "<group>".into());
        rest.insert("fileEncoding".into(), "4".into());
        if let Some(kind) = last_known_file_type(file) {
            rest.insert("lastKnownFileType".into(), kind.into());
        }
        if let Some(name) = file.file_name().and_then(|s| s.to_str()) {
            if name != rel_str {
                rest.insert("name".into(), name.into());
            }
        }
        self.objects.insert(
            id.clone(),
            Node::FileReference(FileReferenceNode { path: rel_str, rest }),
        );
        self.push_child(group, id.clone())?;
        Ok(id)
    }

    /// Wraps a registered file reference in a new build file.
    pub fn add_build_file(&mut self, file_ref: &ObjectId) -> Result<ObjectId, GraphError> {
        match self.objects.get(file_ref) {
            Some(Node::FileReference(_)) => {}
            Some(_) => {
                return Err(GraphError::WrongKind {
                    id: file_ref.clone(),
                    expected: "file reference",
                })
            }
            None => return Err(GraphError::UnknownObject(file_ref.clone())),
        }
        let id = self.allocate_id(&format!("build:{}", file_ref));
        self.objects.insert(
            id.clone(),
            Node::BuildFile(BuildFileNode {
                file_ref: file_ref.clone(),
                rest: Dict::new(),
            }),
        );
        Ok(id)
    }

    /// Appends a registered build file to a sources build phase.
    pub fn add_to_build_phase(
        &mut self,
        phase: &ObjectId,
        build_file: &ObjectId,
    ) -> Result<(), GraphError> {
        match self.objects.get(build_file) {
            Some(Node::BuildFile(_)) => {}
            Some(_) => {
                return Err(GraphError::WrongKind {
                    id: build_file.clone(),
                    expected: "build file",
                })
            }
            None => return Err(GraphError::UnknownObject(build_file.clone())),
        }
        match self.objects.get_mut(phase) {
            Some(Node::SourcesBuildPhase(p)) => {
                p.files.push(build_file.clone());
                Ok(())
            }
            Some(_) => Err(GraphError::WrongKind {
                id: phase.clone(),
                expected: "sources build phase",
            }),
            None => Err(GraphError::UnknownObject(phase.clone())),
        }
    }

    fn expect_group(&self, id: &ObjectId) -> Result<(), GraphError> {
        match self.objects.get(id) {
            Some(Node::Group(_)) => Ok(()),
            Some(_) => Err(GraphError::WrongKind {
                id: id.clone(),
                expected: "group",
            }),
            None => Err(GraphError::UnknownObject(id.clone())),
        }
    }

    fn push_child(&mut self, parent: &ObjectId, child: ObjectId) -> Result<(), GraphError> {
        match self.objects.get_mut(parent) {
            Some(Node::Group(g)) => {
                g.children.push(child);
                Ok(())
            }
            _ => Err(GraphError::UnknownObject(parent.clone())),
        }
    }

    /// 24 uppercase hex digits, never colliding with an existing object.
    fn allocate_id(&mut self, seed: &str) -> ObjectId {
        loop {
            self.id_counter += 1;
            let mut hasher = Sha256::new();
            hasher.update(seed.as_bytes());
            hasher.update(self.objects.len().to_le_bytes());
            hasher.update(self.id_counter.to_le_bytes());
            let digest = hasher.finalize();
            let id = ObjectId(hex::encode_upper(&digest[..12]));
            if !self.objects.contains_key(&id) && id != self.root_object {
                return id;
            }
        }
    }
}

fn project_file(path: &Path) -> PathBuf {
    if path.extension().and_then(|e| e.to_str()) == Some("pbxproj") {
        path.to_path_buf()
    } else {
        path.join(PROJECT_FILE)
    }
}

fn last_known_file_type(file: &Path) -> Option<&'static str> {
    match file.extension().and_then(|e| e.to_str()) {
        Some("swift") => Some("sourcecode.swift"),
        Some("m") => Some("sourcecode.c.objc"),
        Some("h") => Some("sourcecode.c.h"),
        _ => None,
    }
}

/// Lexically drops `.` components and folds `..` into its parent.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::CurDir => {}
            Component::ParentDir => {
                let _ = out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// `path` expressed relative to `base`, using `..` where they diverge.
pub fn relative_path(path: &Path, base: &Path) -> PathBuf {
    let path = normalize_path(path);
    let base = normalize_path(base);
    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();
    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    let mut out = PathBuf::new();
    for _ in common..base_parts.len() {
        out.push("..");
    }
    for part in &path_parts[common..] {
        out.push(part.as_os_str());
    }
    out
}

/// Where each step of a harness injection landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HarnessInjection {
    pub group: ObjectId,
    pub file_ref: ObjectId,
    pub build_file: ObjectId,
    pub sources_phase: ObjectId,
}

/// Step of the harness injection, named in failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStep {
    RootGroup,
    AddGroup,
    AddFileReference,
    AddBuildFile,
    Target,
    SourcesPhase,
    AddToPhase,
    Persist,
}

impl MutationStep {
    pub fn as_str(self) -> &'static str {
        match self {
            MutationStep::RootGroup => "root-group",
            MutationStep::AddGroup => "add-group",
            MutationStep::AddFileReference => "add-file-reference",
            MutationStep::AddBuildFile => "add-build-file",
            MutationStep::Target => "target",
            MutationStep::SourcesPhase => "sources-phase",
            MutationStep::AddToPhase => "add-to-phase",
            MutationStep::Persist => "persist",
        }
    }
}

impl fmt::Display for MutationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("graph mutation failed at {step}: {message}")]
pub struct GraphMutationError {
    pub step: MutationStep,
    pub message: String,
}

impl GraphMutationError {
    fn new(step: MutationStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
        }
    }
}

/// Registers `harness` in `graph` and wires it into `target`'s sources phase,
/// then persists the graph to `destination`. Steps run in a fixed order and
/// the first failure aborts the rest; nothing is written unless every
/// in-memory step succeeded.
pub fn inject_harness(
    graph: &mut ProjectGraph,
    target: &str,
    harness: &Path,
    source_root: &Path,
    destination: &Path,
) -> Result<HarnessInjection, GraphMutationError> {
    use MutationStep::*;
    let root = graph
        .root_group()
        .ok_or_else(|| GraphMutationError::new(RootGroup, "project has no root group"))?;
    let group = graph
        .add_group(&root, GENERATED_GROUP_NAME)
        .map_err(|e| GraphMutationError::new(AddGroup, e.to_string()))?;
    let file_ref = graph
        .add_file_reference(&group, harness, source_root)
        .map_err(|e| GraphMutationError::new(AddFileReference, e.to_string()))?;
    let build_file = graph
        .add_build_file(&file_ref)
        .map_err(|e| GraphMutationError::new(AddBuildFile, e.to_string()))?;
    let target_id = graph
        .find_target(target)
        .ok_or_else(|| GraphMutationError::new(Target, format!("no target named '{}'", target)))?;
    let sources_phase = graph.sources_build_phase(&target_id).ok_or_else(|| {
        GraphMutationError::new(
            SourcesPhase,
            format!("target '{}' has no sources build phase", target),
        )
    })?;
    graph
        .add_to_build_phase(&sources_phase, &build_file)
        .map_err(|e| GraphMutationError::new(AddToPhase, e.to_string()))?;
    graph
        .save(destination)
        .map_err(|e| GraphMutationError::new(Persist, e.to_string()))?;
    debug!(
        group = %group,
        file_ref = %file_ref,
        build_file = %build_file,
        "harness injected"
    );
    Ok(HarnessInjection {
        group,
        file_ref,
        build_file,
        sources_phase,
    })
}
