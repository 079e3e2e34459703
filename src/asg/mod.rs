//! ASG: граф операций, которым владеет конвейер оптимизации.
//!
//! Граф: ориентированный мультиграф: узлы-операции и рёбра данных
//! «выход узла → вход узла». Тела управляющих конструкций (`If`, `Loop`)
//! хранятся внутри своего узла в `Node::subgraphs` и принадлежат ему.

pub mod shape;

use ndarray::ArrayD;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;

pub use shape::{Dimension, Shape};

/// Идентификатор узла (уникален в пределах одного графа)
pub type NodeId = usize;
/// Идентификатор графа
pub type GraphId = usize;

pub type GraphResult<T> = std::result::Result<T, GraphError>;

pub const OP_PARAMETER: &str = "Parameter";
pub const OP_CONST: &str = "Const";
pub const OP_RESULT: &str = "Result";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GraphError {
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
    #[error("port {port} is out of range for node {node} ({available} available)")]
    PortOutOfRange { node: NodeId, port: usize, available: usize },
    #[error("edge {0} references a node that is not in the graph")]
    DanglingEdge(Edge),
    #[error("input port {0} already has a producer")]
    InputAlreadyConnected(PortRef),
    #[error("graph contains a data-dependency cycle through nodes {0:?}")]
    Cycle(Vec<NodeId>),
    #[error("node stored under id {key} carries id {id}")]
    IdMismatch { key: NodeId, id: NodeId },
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F16,
    I32,
    I64,
    Bool,
}

/// Ссылка на порт узла (вход или выход, по контексту)
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortRef {
    pub node: NodeId,
    pub port: usize,
}

impl PortRef {
    pub fn new(node: NodeId, port: usize) -> Self {
        Self { node, port }
    }
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

/// Ребро данных: выход `src` питает вход `dst`
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub src: PortRef,
    pub dst: PortRef,
}

impl std::fmt::Display for Edge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Attribute {
    Int(i64),
    Float(f64),
    Str(String),
    Ints(Vec<i64>),
    Shape(Shape),
    DType(DType),
    Tensor(ArrayD<f32>),
}

/// Метаданные выхода: `None` до вывода форм
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputPort {
    pub shape: Option<Shape>,
    pub dtype: Option<DType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: Option<String>,
    pub op: String,
    /// Атрибуты в порядке объявления
    #[serde(default)]
    pub attrs: Vec<(String, Attribute)>,
    pub num_inputs: usize,
    pub outputs: Vec<OutputPort>,
    /// Тела управляющих конструкций
    #[serde(default)]
    pub subgraphs: Vec<Graph>,
}

impl Node {
    pub fn attr(&self, key: &str) -> Option<&Attribute> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Заменяет значение на месте, сохраняя порядок; новый ключ добавляется в конец.
    pub fn set_attr(&mut self, key: &str, value: Attribute) {
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((key.to_string(), value)),
        }
    }

    pub fn attr_int(&self, key: &str) -> Option<i64> {
        match self.attr(key) {
            Some(Attribute::Int(v)) => Some(*v),
            _ => None,
        }
    }

    pub fn attr_ints(&self, key: &str) -> Option<&[i64]> {
        match self.attr(key) {
            Some(Attribute::Ints(v)) => Some(v),
            _ => None,
        }
    }

    pub fn attr_shape(&self, key: &str) -> Option<&Shape> {
        match self.attr(key) {
            Some(Attribute::Shape(s)) => Some(s),
            _ => None,
        }
    }

    pub fn attr_dtype(&self, key: &str) -> Option<DType> {
        match self.attr(key) {
            Some(Attribute::DType(d)) => Some(*d),
            _ => None,
        }
    }

    /// Имя узла, а если его нет, идентификатор.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.to_string())
    }

    pub fn output_shape(&self, port: usize) -> Option<&Shape> {
        self.outputs.get(port).and_then(|o| o.shape.as_ref())
    }

    pub fn is_parameter(&self) -> bool {
        self.op == OP_PARAMETER
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub id: GraphId,
    pub name: Option<String>,
    nodes: BTreeMap<NodeId, Node>,
    #[serde(default)]
    edges: Vec<Edge>,
    #[serde(default)]
    next_id: NodeId,
}

impl Graph {
    pub fn new(id: GraphId, name: Option<String>) -> Self {
        Self { id, name, nodes: BTreeMap::new(), edges: vec![], next_id: 0 }
    }

    fn allocate_id(&mut self) -> NodeId {
        // После десериализации `next_id` может отставать от ключей.
        let floor = self.nodes.keys().next_back().map_or(0, |k| k + 1);
        let id = self.next_id.max(floor);
        self.next_id = id + 1;
        id
    }

    pub fn add_node(
        &mut self,
        op: &str,
        name: Option<String>,
        num_inputs: usize,
        num_outputs: usize,
    ) -> NodeId {
        let id = self.allocate_id();
        let node = Node {
            id,
            name,
            op: op.to_string(),
            attrs: vec![],
            num_inputs,
            outputs: vec![OutputPort::default(); num_outputs],
            subgraphs: vec![],
        };
        self.nodes.insert(id, node);
        id
    }

    /// Добавляет узел и сразу подключает его входы по порядку.
    pub fn add_op(&mut self, op: &str, inputs: &[PortRef], num_outputs: usize) -> GraphResult<NodeId> {
        for src in inputs {
            self.check_output(*src)?;
        }
        let id = self.add_node(op, None, inputs.len(), num_outputs);
        for (port, src) in inputs.iter().enumerate() {
            self.connect(*src, PortRef::new(id, port))?;
        }
        Ok(id)
    }

    /// Вход графа. Объявленная форма может содержать динамические размерности.
    pub fn add_parameter(&mut self, name: &str, shape: Option<Shape>, dtype: DType) -> NodeId {
        let id = self.add_node(OP_PARAMETER, Some(name.to_string()), 0, 1);
        if let Some(node) = self.nodes.get_mut(&id) {
            if let Some(shape) = shape {
                node.set_attr("shape", Attribute::Shape(shape));
            }
            node.set_attr("dtype", Attribute::DType(dtype));
        }
        id
    }

    pub fn add_const(&mut self, name: &str, value: ArrayD<f32>) -> NodeId {
        let id = self.add_node(OP_CONST, Some(name.to_string()), 0, 1);
        if let Some(node) = self.nodes.get_mut(&id) {
            node.set_attr("value", Attribute::Tensor(value));
            node.set_attr("dtype", Attribute::DType(DType::F32));
        }
        id
    }

    pub fn add_result(&mut self, name: &str, src: PortRef) -> GraphResult<NodeId> {
        let id = self.add_op(OP_RESULT, &[src], 0)?;
        self.node_mut(id)?.name = Some(name.to_string());
        Ok(id)
    }

    pub fn node(&self, id: NodeId) -> GraphResult<&Node> {
        self.nodes.get(&id).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn node_mut(&mut self, id: NodeId) -> GraphResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(GraphError::NodeNotFound(id))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Узлы в порядке возрастания идентификатора
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn nodes_mut(&mut self) -> impl Iterator<Item = &mut Node> {
        self.nodes.values_mut()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Удаляет узел вместе со всеми инцидентными рёбрами.
    pub fn remove_node(&mut self, id: NodeId) -> GraphResult<Node> {
        let node = self.nodes.remove(&id).ok_or(GraphError::NodeNotFound(id))?;
        self.edges.retain(|e| e.src.node != id && e.dst.node != id);
        Ok(node)
    }

    fn check_output(&self, src: PortRef) -> GraphResult<()> {
        let node = self.node(src.node)?;
        if src.port >= node.outputs.len() {
            return Err(GraphError::PortOutOfRange {
                node: src.node,
                port: src.port,
                available: node.outputs.len(),
            });
        }
        Ok(())
    }

    fn check_input(&self, dst: PortRef) -> GraphResult<()> {
        let node = self.node(dst.node)?;
        if dst.port >= node.num_inputs {
            return Err(GraphError::PortOutOfRange {
                node: dst.node,
                port: dst.port,
                available: node.num_inputs,
            });
        }
        Ok(())
    }

    pub fn connect(&mut self, src: PortRef, dst: PortRef) -> GraphResult<()> {
        self.check_output(src)?;
        self.check_input(dst)?;
        if self.producer(dst).is_some() {
            return Err(GraphError::InputAlreadyConnected(dst));
        }
        self.edges.push(Edge { src, dst });
        Ok(())
    }

    pub fn disconnect_input(&mut self, dst: PortRef) -> Option<Edge> {
        let pos = self.edges.iter().position(|e| e.dst == dst)?;
        Some(self.edges.remove(pos))
    }

    /// Переключает всех потребителей выхода `from` на выход `to`.
    pub fn redirect_consumers(&mut self, from: PortRef, to: PortRef) -> GraphResult<()> {
        self.check_output(to)?;
        for edge in self.edges.iter_mut().filter(|e| e.src == from) {
            edge.src = to;
        }
        Ok(())
    }

    pub fn producer(&self, dst: PortRef) -> Option<PortRef> {
        self.edges.iter().find(|e| e.dst == dst).map(|e| e.src)
    }

    pub fn consumers(&self, src: PortRef) -> Vec<PortRef> {
        let mut out: Vec<PortRef> = self.edges.iter().filter(|e| e.src == src).map(|e| e.dst).collect();
        out.sort();
        out
    }

    /// Входящие рёбра узла, упорядоченные по номеру входного порта.
    pub fn input_edges(&self, id: NodeId) -> Vec<Edge> {
        let mut out: Vec<Edge> = self.edges.iter().filter(|e| e.dst.node == id).copied().collect();
        out.sort_by_key(|e| e.dst.port);
        out
    }

    pub fn parameters(&self) -> Vec<NodeId> {
        self.nodes.values().filter(|n| n.op == OP_PARAMETER).map(|n| n.id).collect()
    }

    pub fn results(&self) -> Vec<NodeId> {
        self.nodes.values().filter(|n| n.op == OP_RESULT).map(|n| n.id).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find(|n| n.name.as_deref() == Some(name)).map(|n| n.id)
    }

    /// Проверка структурных инвариантов (рекурсивно, включая тела).
    pub fn validate(&self) -> GraphResult<()> {
        if let Some((key, node)) = self.nodes.iter().find(|(key, node)| **key != node.id) {
            return Err(GraphError::IdMismatch { key: *key, id: node.id });
        }
        let mut driven = HashMap::new();
        for edge in &self.edges {
            if !self.contains(edge.src.node) || !self.contains(edge.dst.node) {
                return Err(GraphError::DanglingEdge(*edge));
            }
            self.check_output(edge.src)?;
            self.check_input(edge.dst)?;
            if driven.insert(edge.dst, edge.src).is_some() {
                return Err(GraphError::InputAlreadyConnected(edge.dst));
            }
        }
        for node in self.nodes.values() {
            for body in &node.subgraphs {
                body.validate()?;
            }
        }
        Ok(())
    }

    fn dependency_graph(&self) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut graph = DiGraph::<NodeId, ()>::new();
        let mut index = HashMap::new();
        for &id in self.nodes.keys() {
            index.insert(id, graph.add_node(id));
        }
        for edge in &self.edges {
            if let (Some(&from), Some(&to)) = (index.get(&edge.src.node), index.get(&edge.dst.node)) {
                graph.add_edge(from, to, ());
            }
        }
        (graph, index)
    }

    /// Порядок по зависимостям данных: каждый узел после всех своих производителей.
    pub fn topological_order(&self) -> GraphResult<Vec<NodeId>> {
        if let Some(edge) = self.edges.iter().find(|e| !self.contains(e.src.node) || !self.contains(e.dst.node)) {
            return Err(GraphError::DanglingEdge(*edge));
        }
        let (graph, _) = self.dependency_graph();
        match toposort(&graph, None) {
            Ok(order) => Ok(order.into_iter().map(|ix| graph[ix]).collect()),
            Err(_) => {
                let mut cyclic: Vec<NodeId> = tarjan_scc(&graph)
                    .into_iter()
                    .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
                    .flatten()
                    .map(|ix| graph[ix])
                    .collect();
                cyclic.sort_unstable();
                Err(GraphError::Cycle(cyclic))
            }
        }
    }

    /// Обход всех вложенных тел в глубину (сам граф не посещается).
    pub fn for_each_subgraph_mut<E>(
        &mut self,
        f: &mut dyn FnMut(&mut Graph) -> Result<(), E>,
    ) -> Result<(), E> {
        for node in self.nodes.values_mut() {
            for body in node.subgraphs.iter_mut() {
                f(body)?;
                body.for_each_subgraph_mut(f)?;
            }
        }
        Ok(())
    }
}
