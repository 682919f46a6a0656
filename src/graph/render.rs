//! Text renderings of an entity graph (Mermaid and GraphViz DOT)

use serde::{Deserialize, Serialize};
use std::fmt::Write;
use std::str::FromStr;

use super::{EdgeKind, EntityEdge, EntityGraph, NodeRecord, StoredValue};
use crate::ids::EntityId;

/// Output format for graph exports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    #[default]
    Mermaid,
    Dot,
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mermaid" | "mmd" => Ok(Self::Mermaid),
            "dot" | "graphviz" => Ok(Self::Dot),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

/// Color mapping by node role
const ROOT_COLOR: &str = "#FF9800";
const NODE_COLOR: &str = "#00BCD4";
const EXTERNAL_COLOR: &str = "#607D8B";

fn node_key(id: EntityId) -> String {
    format!("e{}", id.as_uuid().simple())
}

fn escape(text: &str) -> String {
    text.replace('"', "#quot;")
}

impl EntityGraph {
    pub fn render(&self, format: ExportFormat, include_fields: bool) -> String {
        match format {
            ExportFormat::Mermaid => self.to_mermaid(include_fields),
            ExportFormat::Dot => self.to_dot(),
        }
    }

    /// Mermaid flowchart: solid arrows for ownership, dotted for references
    pub fn to_mermaid(&self, include_fields: bool) -> String {
        let mut out = String::from("graph TD\n");

        for record in self.records() {
            let class = if record.entity_id == self.root_id {
                "rootNode"
            } else {
                "entityNode"
            };
            let mut label = format!("{} {}", record.type_name(), record.entity_id.short());
            if include_fields {
                label.push_str(&field_lines(self, record));
            }
            let _ = writeln!(
                out,
                "  {}[\"{}\"]:::{}",
                node_key(record.entity_id),
                escape(&label),
                class
            );
        }
        for edge in &self.external_references {
            let _ = writeln!(
                out,
                "  {}([\"external {}\"]):::externalNode",
                node_key(edge.target),
                edge.target.short()
            );
        }

        for edge in self.edges().chain(self.external_references.iter()) {
            let arrow = match edge.kind {
                EdgeKind::Ownership => "-->",
                EdgeKind::Reference => "-.->",
            };
            let _ = writeln!(
                out,
                "  {} {}|{}| {}",
                node_key(edge.source),
                arrow,
                escape(&edge.label()),
                node_key(edge.target)
            );
        }

        let _ = writeln!(out, "  classDef rootNode fill:{},color:#fff", ROOT_COLOR);
        let _ = writeln!(out, "  classDef entityNode fill:{},color:#fff", NODE_COLOR);
        let _ = writeln!(out, "  classDef externalNode fill:{},color:#fff", EXTERNAL_COLOR);
        out
    }

    /// Export the entity graph to GraphViz DOT format
    pub fn to_dot(&self) -> String {
        let mut output = String::new();

        // Header with styling
        output.push_str("digraph EntityGraph {\n");
        output.push_str("  rankdir=TB;\n");
        output.push_str("  bgcolor=\"#1e1e1e\";\n");
        output.push_str("  node [shape=box, style=\"filled,rounded\", fontname=\"Helvetica\", fontsize=10, fontcolor=\"white\", color=\"#404040\"];\n");
        output.push_str("  edge [fontname=\"Helvetica\", fontsize=8, fontcolor=\"#808080\"];\n");
        output.push('\n');

        // Nodes
        for record in self.records() {
            let color = if record.entity_id == self.root_id {
                ROOT_COLOR
            } else {
                NODE_COLOR
            };
            let _ = writeln!(
                output,
                "  \"{}\" [label=\"{}\\n{}\", fillcolor=\"{}\"];",
                node_key(record.entity_id),
                record.type_name(),
                record.entity_id.short(),
                color
            );
        }
        for edge in &self.external_references {
            let _ = writeln!(
                output,
                "  \"{}\" [label=\"external\\n{}\", fillcolor=\"{}\", style=\"filled,dashed\"];",
                node_key(edge.target),
                edge.target.short(),
                EXTERNAL_COLOR
            );
        }

        output.push('\n');

        // Edges
        for edge in self.edges().chain(self.external_references.iter()) {
            output.push_str(&dot_edge(edge));
        }

        output.push_str("}\n");
        output
    }
}

fn dot_edge(edge: &EntityEdge) -> String {
    let style = match edge.kind {
        EdgeKind::Ownership => "solid",
        EdgeKind::Reference => "dashed",
    };
    format!(
        "  \"{}\" -> \"{}\" [label=\"{}\", style={}];\n",
        node_key(edge.source),
        node_key(edge.target),
        edge.label().replace('"', "\\\""),
        style
    )
}

fn field_lines(graph: &EntityGraph, record: &NodeRecord) -> String {
    let mut lines = format!(
        "<br/>entity_id: {}<br/>lineage_id: {}<br/>root: {}",
        record.entity_id,
        record.lineage_id,
        graph.root_id()
    );
    for (name, value) in &record.fields {
        match value {
            StoredValue::Scalar(s) => {
                let _ = write!(lines, "<br/>{}: {}", name, s);
            }
            StoredValue::Plain(v) => {
                let _ = write!(lines, "<br/>{}: {}", name, v);
            }
            _ => {}
        }
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::Entity;
    use crate::graph::build_entity_graph;
    use crate::schema::{EntitySchema, ValueKind};

    fn tree() -> (Entity, EntityGraph) {
        let leaf = EntitySchema::new("Leaf").field("name", ValueKind::Scalar).build();
        let node = EntitySchema::new("Node")
            .field("entities", ValueKind::EntitySequence)
            .optional("watch", ValueKind::Reference)
            .build();
        let mut root = Entity::new(node);
        let a = Entity::new(leaf.clone()).with("name", "first").unwrap();
        let b = Entity::new(leaf).with("name", "second").unwrap();
        let b_ref = b.reference();
        root.set("entities", vec![a, b]).unwrap();
        root.set("watch", b_ref).unwrap();
        let graph = build_entity_graph(&mut root).unwrap();
        (root, graph)
    }

    #[test]
    fn test_mermaid_nodes_and_edges() {
        let (root, graph) = tree();
        let diagram = graph.to_mermaid(false);
        assert!(diagram.starts_with("graph TD\n"));
        assert!(diagram.contains("rootNode"));
        assert!(diagram.contains(&format!("Node {}", root.entity_id().short())));
        assert!(diagram.contains("-->|entities[0]|"));
        assert!(diagram.contains("-->|entities[1]|"));
        assert!(diagram.contains("-.->|watch|"));
        assert!(!diagram.contains("lineage_id:"));
    }

    #[test]
    fn test_mermaid_with_fields() {
        let (_, graph) = tree();
        let diagram = graph.to_mermaid(true);
        assert!(diagram.contains("entity_id:"));
        assert!(diagram.contains("lineage_id:"));
        assert!(diagram.contains("root:"));
        assert!(diagram.contains("name: first"));
    }

    #[test]
    fn test_dot_output() {
        let (_, graph) = tree();
        let dot = graph.render(ExportFormat::Dot, false);
        assert!(dot.starts_with("digraph EntityGraph {"));
        assert_eq!(dot.matches("style=dashed").count(), 1);
        assert_eq!(dot.matches("style=solid").count(), 2);
        assert!(dot.trim_end().ends_with('}'));
    }

    #[test]
    fn test_export_format_parse() {
        assert_eq!("DOT".parse::<ExportFormat>().unwrap(), ExportFormat::Dot);
        assert_eq!("mermaid".parse::<ExportFormat>().unwrap(), ExportFormat::Mermaid);
        assert!("svg".parse::<ExportFormat>().is_err());
    }
}
