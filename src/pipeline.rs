//! Pipeline: an ordered, linear composition of processors (§3). Composable
//! with `>>`; an [`Attachment`] prepended with `>>` mutates the first
//! processor of whatever follows instead of appearing in the sequence
//! itself.

use std::collections::HashMap;
use std::ops::Shr;

use crate::processor::{Attachment, Processor};

#[derive(Clone, Default)]
pub struct Pipeline {
    name: Option<String>,
    processors: Vec<Processor>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(processor: Processor) -> Self {
        Self {
            name: None,
            processors: vec![processor],
        }
    }

    /// Names the pipeline for disambiguation purposes (`<name>.<processor
    /// id>`, repeated ids further suffixed `.2`, `.3`, … per §3).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn processors(&self) -> &[Processor] {
        &self.processors
    }

    fn extend_with(mut self, other: Pipeline) -> Pipeline {
        self.processors.extend(other.processors);
        self
    }

    /// Resolves the disambiguated `(id, processor)` pairs this pipeline
    /// contributes to a program's processor index: `<pipeline
    /// name>.<processor id>` when named, the bare processor id otherwise,
    /// with a `.2`, `.3`, … suffix for repeats of the same resolved id.
    pub fn disambiguated_ids(&self) -> Vec<(String, Processor)> {
        let mut seen: HashMap<String, usize> = HashMap::new();
        self.processors
            .iter()
            .map(|processor| {
                let base = match &self.name {
                    Some(name) => format!("{name}.{}", processor.id),
                    None => processor.id.clone(),
                };
                let count = seen.entry(base.clone()).or_insert(0);
                *count += 1;
                let id = if *count == 1 {
                    base
                } else {
                    format!("{base}.{count}")
                };
                (id, processor.clone())
            })
            .collect()
    }
}

impl From<Processor> for Pipeline {
    fn from(processor: Processor) -> Self {
        Pipeline::single(processor)
    }
}

impl Shr<Processor> for Pipeline {
    type Output = Pipeline;
    fn shr(self, rhs: Processor) -> Pipeline {
        self.extend_with(Pipeline::single(rhs))
    }
}

impl Shr<Pipeline> for Pipeline {
    type Output = Pipeline;
    fn shr(self, rhs: Pipeline) -> Pipeline {
        self.extend_with(rhs)
    }
}

impl Shr<Processor> for Processor {
    type Output = Pipeline;
    fn shr(self, rhs: Processor) -> Pipeline {
        Pipeline::single(self).extend_with(Pipeline::single(rhs))
    }
}

impl Shr<Pipeline> for Processor {
    type Output = Pipeline;
    fn shr(self, rhs: Pipeline) -> Pipeline {
        Pipeline::single(self).extend_with(rhs)
    }
}

impl Shr<Processor> for Attachment {
    type Output = Pipeline;
    fn shr(self, rhs: Processor) -> Pipeline {
        Pipeline::single(self.apply(rhs))
    }
}

impl Shr<Pipeline> for Attachment {
    type Output = Pipeline;
    fn shr(self, mut rhs: Pipeline) -> Pipeline {
        if let Some(first) = rhs.processors.first().cloned() {
            rhs.processors[0] = self.apply(first);
        }
        rhs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::with_resolution_scope;
    use crate::context::Context;
    use crate::response::ResponseHandler;

    fn noop(id: &str) -> Processor {
        Processor::from_fn(id, |_ctx, _response| async { Ok(()) })
    }

    #[tokio::test]
    async fn composed_pipeline_runs_processors_in_order() {
        let pipeline = noop("p1") >> noop("p2") >> noop("p3");
        assert_eq!(pipeline.processors().len(), 3);
        let ctx = Context::new();
        let response = ResponseHandler::new();
        with_resolution_scope(async {
            for processor in pipeline.processors() {
                processor.call(&ctx, &response).await.unwrap();
            }
        })
        .await;
    }

    #[test]
    fn repeated_processor_ids_are_disambiguated_with_a_numeric_suffix() {
        let pipeline = (noop("step") >> noop("step")).named("ingest");
        let ids: Vec<String> = pipeline
            .disambiguated_ids()
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(ids, vec!["ingest.step".to_string(), "ingest.step.2".to_string()]);
    }
}
