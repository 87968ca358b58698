//! Program: a named, versioned bundle of pipelines with the indices the
//! engine dispatch loop reads from (§3): processor-id → processor,
//! processor-id → next-id, event-name → listener ids, and an optional
//! message-mapping applied to arriving messages before a processor runs.

use std::collections::HashMap;

use crate::context::{ContextManager, ContextManagerStack, Path};
use crate::pipeline::Pipeline;
use crate::processor::Processor;

use std::sync::Arc;

pub struct Program {
    pub name: String,
    pub version: Option<String>,
    pub id: String,
    processors: HashMap<String, Processor>,
    /// Insertion order of each pipeline's processors, kept separately from
    /// `processors` (a `HashMap`) so `next_processor` can walk it.
    next_processor: HashMap<String, Option<String>>,
    events: HashMap<String, Vec<String>>,
    message_mapping: HashMap<String, Path>,
    pub context_managers: ContextManagerStack,
}

impl Program {
    pub fn processor(&self, id: &str) -> Option<&Processor> {
        self.processors.get(id)
    }

    pub fn next_processor_id(&self, id: &str) -> Option<&str> {
        self.next_processor.get(id).and_then(|next| next.as_deref())
    }

    pub fn processors_for_event(&self, name: &str) -> &[String] {
        self.events.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn message_mapping(&self) -> &HashMap<String, Path> {
        &self.message_mapping
    }

    pub fn processor_ids(&self) -> impl Iterator<Item = &String> {
        self.processors.keys()
    }
}

/// Builds a [`Program`] from one or more pipelines, wiring the processor
/// indices as each pipeline is added.
#[derive(Default)]
pub struct ProgramBuilder {
    name: String,
    version: Option<String>,
    processors: HashMap<String, Processor>,
    next_processor: HashMap<String, Option<String>>,
    events: HashMap<String, Vec<String>>,
    message_mapping: HashMap<String, Path>,
    context_managers: ContextManagerStack,
}

impl ProgramBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Registers a pipeline's processors, disambiguating ids and chaining
    /// each processor to the next one in the pipeline (the last processor's
    /// `next_processor` is `None`).
    pub fn pipeline(mut self, pipeline: Pipeline) -> Self {
        let entries = pipeline.disambiguated_ids();
        for (index, (id, processor)) in entries.iter().enumerate() {
            for event in &processor.monitor_events {
                self.events.entry(event.clone()).or_default().push(id.clone());
            }
            let next = entries.get(index + 1).map(|(next_id, _)| next_id.clone());
            self.next_processor.insert(id.clone(), next);
            self.processors.insert(id.clone(), processor.clone());
        }
        self
    }

    pub fn map_message(mut self, context_key: impl Into<String>, path: Path) -> Self {
        self.message_mapping.insert(context_key.into(), path);
        self
    }

    pub fn context_manager(mut self, manager: Arc<dyn ContextManager>) -> Self {
        self.context_managers.push(manager);
        self
    }

    pub fn build(self) -> Program {
        let id = match &self.version {
            Some(version) => format!("{}={}", self.name, version),
            None => self.name.clone(),
        };
        Program {
            name: self.name,
            version: self.version,
            id,
            processors: self.processors,
            next_processor: self.next_processor,
            events: self.events,
            message_mapping: self.message_mapping,
            context_managers: self.context_managers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;

    fn noop(id: &str) -> Processor {
        Processor::from_fn(id, |_ctx, _response| async { Ok(()) })
    }

    #[test]
    fn pipeline_processors_chain_to_the_next_and_last_has_none() {
        let program = ProgramBuilder::new("prog")
            .pipeline((noop("a") >> noop("b") >> noop("c")).named("p"))
            .build();
        assert_eq!(program.next_processor_id("p.a"), Some("p.b"));
        assert_eq!(program.next_processor_id("p.b"), Some("p.c"));
        assert_eq!(program.next_processor_id("p.c"), None);
    }

    #[test]
    fn monitored_events_are_indexed_in_insertion_order() {
        let x = noop("x").monitor_event("E");
        let y = noop("y").monitor_event("E");
        let z = noop("z");
        let program = ProgramBuilder::new("prog")
            .pipeline(Pipeline::single(x).named("p1"))
            .pipeline(Pipeline::single(y).named("p2"))
            .pipeline(Pipeline::single(z).named("p3"))
            .build();
        assert_eq!(program.processors_for_event("E"), &["p1.x".to_string(), "p2.y".to_string()]);
        assert!(program.processors_for_event("other").is_empty());
    }

    #[test]
    fn versioned_program_id_combines_name_and_version() {
        let program = ProgramBuilder::new("prog").version("2").build();
        assert_eq!(program.id, "prog=2");
    }
}
