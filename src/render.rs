//! ASCII rendering of the planet with mood symbols.

use crate::models::Mood;
use crate::state::planet::{ComponentView, GroupView, PlanetView, WorkerInfo};

const HAPPY: char = '●';
const WAKING: char = '◐';
const SLEEPING: char = '○';
const SAD: char = '✗';
const LOST: char = '?';
const UNKNOWN: char = '·';

/// Get the symbol for a component mood.
pub fn mood_symbol(mood: Option<Mood>) -> char {
    match mood {
        Some(Mood::Happy) => HAPPY,
        Some(Mood::Waking) => WAKING,
        Some(Mood::Sleeping) => SLEEPING,
        Some(Mood::Sad) => SAD,
        Some(Mood::Lost) => LOST,
        None => UNKNOWN,
    }
}

/// One line of output and the lines nested under it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeLine {
    pub label: String,
    pub children: Vec<TreeLine>,
}

impl TreeLine {
    pub fn leaf(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            children: Vec::new(),
        }
    }
}

/// Render a planet as a tree, flows first and the atmosphere last.
///
/// Example output:
/// ```text
/// planet
/// ├── default
/// │   ├── ● producer-video (happy)
/// │   └── ○ http-video (sleeping)
/// └── atmosphere
///     └── ● porter-http (happy)
/// ```
pub fn render_planet(planet: &PlanetView<'_>) -> String {
    let mut groups: Vec<TreeLine> = Vec::new();
    for (i, flow) in planet.flows().iter().enumerate() {
        let mut line = group_line(flow);
        if i > 0 {
            line.label.push_str(" (ignored)");
        }
        groups.push(line);
    }
    if let Some(atmosphere) = planet.atmosphere() {
        groups.push(group_line(&atmosphere));
    }

    render_tree(&[TreeLine {
        label: planet.name().unwrap_or("planet").to_string(),
        children: groups,
    }])
}

fn group_line(group: &GroupView<'_>) -> TreeLine {
    TreeLine {
        label: group.name().unwrap_or("?").to_string(),
        children: group.components().iter().map(component_line).collect(),
    }
}

fn component_line(component: &ComponentView<'_>) -> TreeLine {
    let mood = component.mood();
    TreeLine::leaf(format!(
        "{} {} ({})",
        mood_symbol(mood),
        component.name().unwrap_or("?"),
        mood.map(|m| m.as_str()).unwrap_or("unknown")
    ))
}

/// Details for a single component: type, mood, properties, messages.
pub fn render_component(component: &ComponentView<'_>) -> String {
    let mut children = vec![
        TreeLine::leaf(format!(
            "type: {}",
            component.component_type().unwrap_or("unknown")
        )),
        TreeLine::leaf(format!(
            "mood: {} {}",
            mood_symbol(component.mood()),
            component.mood().map(|m| m.as_str()).unwrap_or("unknown")
        )),
    ];

    if let Some(props) = component.properties().filter(|p| !p.is_empty()) {
        let mut names: Vec<&String> = props.keys().collect();
        names.sort();
        children.push(TreeLine {
            label: "properties".into(),
            children: names
                .into_iter()
                .map(|name| TreeLine::leaf(format!("{}: {}", name, props[name.as_str()])))
                .collect(),
        });
    }

    if let Some(messages) = component.messages().filter(|m| !m.is_empty()) {
        children.push(TreeLine {
            label: "messages".into(),
            children: messages
                .iter()
                .map(|(id, message)| TreeLine::leaf(format!("{}: {}", id, message)))
                .collect(),
        });
    }

    render_tree(&[TreeLine {
        label: component.avatar().to_string(),
        children,
    }])
}

pub fn render_workers(workers: &[WorkerInfo]) -> String {
    if workers.is_empty() {
        return "No workers logged in.\n".to_string();
    }
    let lines: Vec<TreeLine> = workers
        .iter()
        .map(|w| match &w.host {
            Some(host) => TreeLine::leaf(format!("{} ({})", w.name, host)),
            None => TreeLine::leaf(w.name.clone()),
        })
        .collect();
    render_tree(&[TreeLine {
        label: "workers".into(),
        children: lines,
    }])
}

/// Render lines as ASCII art.
pub fn render_tree(nodes: &[TreeLine]) -> String {
    let mut output = String::new();
    for (i, node) in nodes.iter().enumerate() {
        let is_last = i == nodes.len() - 1;
        render_node(&mut output, node, "", is_last, true);
    }
    output
}

fn render_node(output: &mut String, node: &TreeLine, prefix: &str, is_last: bool, is_root: bool) {
    if !is_root {
        output.push_str(prefix);
        output.push_str(if is_last { "└── " } else { "├── " });
    }
    output.push_str(&node.label);
    output.push('\n');

    let child_prefix = if is_root {
        String::new()
    } else {
        let continuation = if is_last { "    " } else { "│   " };
        format!("{}{}", prefix, continuation)
    };

    for (i, child) in node.children.iter().enumerate() {
        let child_is_last = i == node.children.len() - 1;
        render_node(output, child, &child_prefix, child_is_last, false);
    }
}
