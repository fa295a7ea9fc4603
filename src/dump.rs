//! GraphViz DOT rendering of task graphs and device flows.

use crate::{
    device::{OpKind, OpNode},
    executor::Plan,
    graph::FlowGraph,
    types::TaskKind,
};
use std::io::{self, Write};

const INDENT: &str = "  ";

struct DotWriter<W> {
    out: W,
    depth: usize,
}

fn escape(label: &str) -> String {
    let mut escaped = String::with_capacity(label.len());
    for ch in label.chars() {
        match ch {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            ch => escaped.push(ch),
        }
    }
    escaped
}

fn task_attrs(kind: TaskKind) -> &'static str {
    match kind {
        TaskKind::Static => "",
        TaskKind::Placeholder => " style=dashed",
        TaskKind::Subflow => " shape=box3d",
        TaskKind::Module => " shape=box3d style=filled",
        TaskKind::Device => " shape=folder",
    }
}

fn op_attrs(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Kernel(_) => " shape=box style=bold",
        OpKind::Noop => " style=dashed",
        OpKind::Upload { .. } | OpKind::Download { .. } => " shape=cds",
        OpKind::Copy { .. } | OpKind::Fill { .. } => " shape=box",
    }
}

impl<W: Write> DotWriter<W> {
    fn new(out: W) -> Self {
        Self { out, depth: 0 }
    }

    fn line(&mut self, args: std::fmt::Arguments<'_>) -> io::Result<()> {
        for _ in 0..self.depth {
            self.out.write_all(INDENT.as_bytes())?;
        }
        self.out.write_fmt(args)?;
        self.out.write_all(b"\n")
    }

    fn begin_graph(&mut self, name: &str) -> io::Result<()> {
        let name = escape(name);
        self.line(format_args!("digraph \"{name}\" {{"))?;
        self.depth += 1;
        self.line(format_args!("label=\"{name}\";"))
    }

    fn begin_cluster(&mut self, id: &str, label: &str) -> io::Result<()> {
        self.line(format_args!("subgraph cluster_{id} {{"))?;
        self.depth += 1;
        self.line(format_args!("label=\"{}\";", escape(label)))
    }

    fn end(&mut self) -> io::Result<()> {
        self.depth = self.depth.checked_sub(1).expect("DotWriter::end");
        self.line(format_args!("}}"))
    }

    fn node(&mut self, id: &str, label: &str, attrs: &str) -> io::Result<()> {
        self.line(format_args!("{id} [label=\"{}\"{attrs}];", escape(label)))
    }

    fn edge(&mut self, from: &str, to: &str) -> io::Result<()> {
        self.line(format_args!("{from} -> {to};"))
    }

    fn module(&mut self, prefix: &str, plan: &Plan) -> io::Result<()> {
        self.begin_cluster(prefix, &format!("module: {}", plan.name()))?;
        let ids: Vec<String> = plan
            .ids()
            .iter()
            .map(|id| format!("{prefix}_{id}"))
            .collect();
        for (node, id) in plan.nodes().iter().zip(&ids) {
            self.node(id, &node.name, task_attrs(node.kind))?;
        }
        for (node, id) in plan.nodes().iter().zip(&ids) {
            for &child in node.owned_children.iter().chain(&node.shared_children) {
                self.edge(id, &ids[child as usize])?;
            }
        }
        for (node, id) in plan.nodes().iter().zip(&ids) {
            if let Some(module) = &node.module {
                self.module(id, module)?;
            }
        }
        self.end()
    }
}

/// Write `graph` as a DOT digraph named `name`.
pub(crate) fn write_taskflow(out: impl Write, name: &str, graph: &FlowGraph) -> io::Result<()> {
    let mut dot = DotWriter::new(out);
    dot.begin_graph(name)?;
    graph.with_nodes(|nodes| {
        for node in nodes {
            dot.node(
                &format!("n{}", node.id),
                &node.display_name(),
                task_attrs(node.kind),
            )?;
        }
        for node in nodes {
            for child in &node.successors {
                dot.edge(&format!("n{}", node.id), &format!("n{child}"))?;
            }
        }
        for node in nodes {
            if let Some(module) = &node.module {
                dot.module(&format!("n{}", node.id), module)?;
            }
        }
        Ok::<_, io::Error>(())
    })?;
    dot.end()
}

/// Write the operations of a device flow as a DOT digraph named `name`.
pub(crate) fn write_device_flow(out: impl Write, name: &str, ops: &[OpNode]) -> io::Result<()> {
    let mut dot = DotWriter::new(out);
    dot.begin_graph(name)?;
    for op in ops {
        let label = format!("{}\n{}", op.display_name(), op.op.kind());
        dot.node(&format!("d{}", op.id), &label, op_attrs(op.op.kind()))?;
    }
    for op in ops {
        for child in &op.successors {
            dot.edge(&format!("d{}", op.id), &format!("d{child}"))?;
        }
    }
    dot.end()
}
