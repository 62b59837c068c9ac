//! Presets and the pipeline builder.
//!
//! A preset is a processor whose work is graph construction: it expands into
//! a tree of [`PipelineStep`]s that runs below the preset's own dataset. The
//! tree is validated by [`PipelineBuilder`] before anything is persisted, and
//! only the roots are materialized up front. Every other step travels in the
//! `next` parameter of the dataset that spawns it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashSet;
use tracing::{debug, info};

use super::dataset::{Dataset, DatasetService, NewDataset};
use super::processors::{
    CountValuesProcessor, OptionKind, Processor, ProcessorContext, ProcessorOption,
    SampleProcessor,
};
use crate::{Error, Result};

/// Parameter naming the dataset a step copies its result into.
pub const ATTACH_TO: &str = "attach_to";
/// Parameter carrying the unmaterialized follow-up steps.
pub const NEXT: &str = "next";

/// Status of a preset dataset while its pipeline runs.
pub const STATUS_AWAITING_PIPELINE: &str = "Awaiting completion of pipeline";

/// One node of a pipeline tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    #[serde(rename = "type")]
    pub processor_type: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub next: Vec<PipelineStep>,
}

impl PipelineStep {
    pub fn new(processor_type: impl Into<String>) -> Self {
        Self {
            processor_type: processor_type.into(),
            parameters: Map::new(),
            next: Vec::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Map<String, Value>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Add a child step that runs on this step's result.
    pub fn then(mut self, step: PipelineStep) -> Self {
        self.next.push(step);
        self
    }

    /// Make this step the sink that finishes `origin`.
    pub fn attach_to(self, origin: impl Into<String>) -> Self {
        self.with_parameter(ATTACH_TO, Value::String(origin.into()))
    }

    pub fn attach_target(&self) -> Option<&str> {
        self.parameters.get(ATTACH_TO).and_then(Value::as_str)
    }

    /// Parameters of the dataset this step becomes, carrying its subtree.
    pub fn dataset_parameters(&self) -> Result<Map<String, Value>> {
        let mut parameters = self.parameters.clone();
        if !self.next.is_empty() {
            parameters.insert(NEXT.to_string(), serde_json::to_value(&self.next)?);
        }
        Ok(parameters)
    }

    /// Pre-order walk over this step and everything below it.
    fn walk<'a>(&'a self, out: &mut Vec<&'a PipelineStep>) {
        out.push(self);
        for child in &self.next {
            child.walk(out);
        }
    }
}

/// What a preset expands into.
#[derive(Debug, Clone, PartialEq)]
pub enum PresetPipeline {
    /// Steps run one after another, each on the previous result.
    Linear(Vec<PipelineStep>),
    /// Explicit trees; a step may fan out into several children.
    Advanced(Vec<PipelineStep>),
}

/// A validated pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    origin: String,
    roots: Vec<PipelineStep>,
}

impl Pipeline {
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn roots(&self) -> &[PipelineStep] {
        &self.roots
    }

    pub fn steps(&self) -> Vec<&PipelineStep> {
        let mut out = Vec::new();
        for root in &self.roots {
            root.walk(&mut out);
        }
        out
    }

    /// The step that finishes the origin dataset.
    pub fn sink(&self) -> Option<&PipelineStep> {
        self.steps()
            .into_iter()
            .find(|step| step.attach_target().is_some())
    }
}

/// Assembles and validates a pipeline before it is materialized.
#[derive(Debug, Clone)]
pub struct PipelineBuilder {
    origin: String,
    definition: PresetPipeline,
    known_types: Option<HashSet<String>>,
}

impl PipelineBuilder {
    /// `[A, B, C]` becomes `A { next: [B { next: [C] }] }`.
    pub fn linear(origin: impl Into<String>, steps: Vec<PipelineStep>) -> Self {
        Self::from_preset(origin, PresetPipeline::Linear(steps))
    }

    pub fn advanced(origin: impl Into<String>, roots: Vec<PipelineStep>) -> Self {
        Self::from_preset(origin, PresetPipeline::Advanced(roots))
    }

    pub fn from_preset(origin: impl Into<String>, definition: PresetPipeline) -> Self {
        Self {
            origin: origin.into(),
            definition,
            known_types: None,
        }
    }

    /// Reject step types outside this set.
    pub fn with_known_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let roots = match self.definition {
            PresetPipeline::Linear(steps) => fold_linear(steps)?,
            PresetPipeline::Advanced(roots) => roots,
        };
        if roots.is_empty() {
            return Err(Error::validation("pipeline has no steps"));
        }

        let pipeline = Pipeline {
            origin: self.origin,
            roots,
        };
        let steps = pipeline.steps();

        for step in &steps {
            if step.processor_type.trim().is_empty() {
                return Err(Error::validation("pipeline step has an empty type"));
            }
            if let Some(known) = &self.known_types
                && !known.contains(&step.processor_type)
            {
                return Err(Error::validation(format!(
                    "pipeline step type '{}' is not registered",
                    step.processor_type
                )));
            }
            if step.parameters.contains_key(NEXT) {
                return Err(Error::validation(format!(
                    "pipeline step '{}' sets the reserved parameter '{NEXT}'",
                    step.processor_type
                )));
            }
        }

        let sinks: Vec<&&PipelineStep> = steps
            .iter()
            .filter(|step| step.parameters.contains_key(ATTACH_TO))
            .collect();
        match sinks.as_slice() {
            [] => {
                return Err(Error::validation(format!(
                    "no pipeline step carries '{ATTACH_TO}', dataset {} would never complete",
                    pipeline.origin
                )));
            }
            [sink] => {
                if sink.attach_target() != Some(pipeline.origin.as_str()) {
                    return Err(Error::validation(format!(
                        "'{ATTACH_TO}' of step '{}' must be the originating dataset {}",
                        sink.processor_type, pipeline.origin
                    )));
                }
            }
            _ => {
                return Err(Error::validation(format!(
                    "{} pipeline steps carry '{ATTACH_TO}', exactly one may",
                    sinks.len()
                )));
            }
        }

        Ok(pipeline)
    }
}

fn fold_linear(steps: Vec<PipelineStep>) -> Result<Vec<PipelineStep>> {
    let mut folded: Option<PipelineStep> = None;
    for mut step in steps.into_iter().rev() {
        if !step.next.is_empty() {
            return Err(Error::validation(format!(
                "linear pipeline step '{}' must not have children",
                step.processor_type
            )));
        }
        if let Some(child) = folded.take() {
            step.next.push(child);
        }
        folded = Some(step);
    }
    Ok(folded.into_iter().collect())
}

/// Create and queue the children `steps` describe under `parent`.
///
/// A child already present with the same type and parameters stands for its
/// step, so running this again after a crash only adds what is missing.
/// Unfinished children found this way get their job back if it was lost.
/// Returns the children created by this call.
pub async fn materialize_steps(
    datasets: &DatasetService,
    parent: &Dataset,
    steps: &[PipelineStep],
) -> Result<Vec<Dataset>> {
    let mut existing = datasets.children(&parent.key).await?;
    let mut created = Vec::new();
    for step in steps {
        let parameters = step.dataset_parameters()?;
        let found = existing.iter().position(|child| {
            child.dataset_type == step.processor_type && child.parameters == parameters
        });
        if let Some(idx) = found {
            let child = existing.swap_remove(idx);
            if !child.is_finished {
                datasets.queue(&child).await?;
            }
            continue;
        }
        let child = datasets
            .create_and_queue(
                NewDataset::new(&step.processor_type)
                    .with_parameters(parameters)
                    .with_owners(parent.owners.clone())
                    .with_parent(&parent.key),
            )
            .await?;
        created.push(child);
    }
    Ok(created)
}

/// Queue the `next` steps carried by a finished dataset as its children.
pub async fn materialize_next(datasets: &DatasetService, dataset: &Dataset) -> Result<Vec<Dataset>> {
    let Some(next) = dataset.parameter(NEXT) else {
        return Ok(Vec::new());
    };
    let steps: Vec<PipelineStep> = serde_json::from_value(next.clone()).map_err(|e| {
        Error::validation(format!("dataset {} has a malformed '{NEXT}': {e}", dataset.key))
    })?;
    materialize_steps(datasets, dataset, &steps).await
}

/// A processor that expands into a pipeline.
pub trait Preset: Send + Sync {
    fn preset_type(&self) -> &str;

    fn max_workers(&self) -> usize {
        1
    }

    fn options(&self) -> Vec<ProcessorOption> {
        Vec::new()
    }

    /// The pipeline to run for `origin`, given its resolved parameters.
    fn pipeline(&self, origin: &Dataset, parameters: &Map<String, Value>)
    -> Result<PresetPipeline>;
}

/// Runs a [`Preset`] as a processor.
pub struct PresetProcessor<P> {
    preset: P,
}

impl<P: Preset> PresetProcessor<P> {
    pub fn new(preset: P) -> Self {
        Self { preset }
    }
}

#[async_trait]
impl<P: Preset> Processor for PresetProcessor<P> {
    fn processor_type(&self) -> &str {
        self.preset.preset_type()
    }

    fn max_workers(&self) -> usize {
        self.preset.max_workers()
    }

    fn options(&self) -> Vec<ProcessorOption> {
        self.preset.options()
    }

    async fn process(&self, ctx: &mut ProcessorContext) -> Result<()> {
        let definition = self.preset.pipeline(ctx.dataset(), ctx.parameters())?;
        let pipeline = PipelineBuilder::from_preset(ctx.key(), definition)
            .with_known_types(ctx.services().registry.jobtypes())
            .build()?;

        ctx.update_status(STATUS_AWAITING_PIPELINE, None).await?;
        // Roots left over from an interrupted run are kept
        let created = materialize_steps(ctx.datasets(), ctx.dataset(), pipeline.roots()).await?;
        if created.len() == pipeline.roots().len() {
            info!(
                dataset_key = %ctx.key(),
                preset = %self.preset.preset_type(),
                steps = pipeline.steps().len(),
                "Preset pipeline queued"
            );
        } else {
            debug!(
                dataset_key = %ctx.key(),
                created = created.len(),
                roots = pipeline.roots().len(),
                "Preset pipeline resumed"
            );
        }

        ctx.defer_completion();
        Ok(())
    }
}

/// Samples the source dataset, then counts the values of one field.
pub struct SampleAndCountPreset;

impl SampleAndCountPreset {
    pub const TYPE: &'static str = "preset-sample-count";
}

impl Preset for SampleAndCountPreset {
    fn preset_type(&self) -> &str {
        Self::TYPE
    }

    fn options(&self) -> Vec<ProcessorOption> {
        vec![
            ProcessorOption::new("limit", OptionKind::Integer, json!(1000))
                .with_help("Rows to sample before counting"),
            ProcessorOption::new("field", OptionKind::String, Value::Null)
                .with_help("Field whose values are counted"),
        ]
    }

    fn pipeline(
        &self,
        origin: &Dataset,
        parameters: &Map<String, Value>,
    ) -> Result<PresetPipeline> {
        let field = parameters
            .get("field")
            .filter(|field| !field.is_null())
            .cloned()
            .ok_or_else(|| Error::processor("A field to count is required"))?;
        let limit = parameters.get("limit").cloned().unwrap_or(json!(1000));

        Ok(PresetPipeline::Linear(vec![
            PipelineStep::new(SampleProcessor::TYPE).with_parameter("limit", limit),
            PipelineStep::new(CountValuesProcessor::TYPE)
                .with_parameter("field", field)
                .attach_to(&origin.key),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn steps() -> Vec<PipelineStep> {
        vec![
            PipelineStep::new("a"),
            PipelineStep::new("b").with_parameter("x", json!(1)),
            PipelineStep::new("c").attach_to("D"),
        ]
    }

    #[test]
    fn test_linear_folds_into_chain() {
        let pipeline = PipelineBuilder::linear("D", steps()).build().unwrap();
        assert_eq!(pipeline.roots().len(), 1);

        let a = &pipeline.roots()[0];
        assert_eq!(a.processor_type, "a");
        let b = &a.next[0];
        assert_eq!(b.processor_type, "b");
        let c = &b.next[0];
        assert_eq!(c.processor_type, "c");
        assert!(c.next.is_empty());
        assert_eq!(pipeline.sink().unwrap().processor_type, "c");
    }

    #[test]
    fn test_linear_without_attach_to_fails() {
        let mut steps = steps();
        steps[2] = PipelineStep::new("c");
        let err = PipelineBuilder::linear("D", steps).build().unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("attach_to")));
    }

    #[test]
    fn test_attach_to_must_match_origin_and_be_unique() {
        assert!(PipelineBuilder::linear("other", steps()).build().is_err());

        let mut steps = steps();
        steps[0] = PipelineStep::new("a").attach_to("D");
        assert!(PipelineBuilder::linear("D", steps).build().is_err());
    }

    #[test]
    fn test_advanced_allows_fan_out() {
        let tree = PipelineStep::new("a")
            .then(PipelineStep::new("b"))
            .then(PipelineStep::new("c").attach_to("D"));
        let pipeline = PipelineBuilder::advanced("D", vec![tree]).build().unwrap();
        assert_eq!(pipeline.roots()[0].next.len(), 2);
        assert_eq!(pipeline.steps().len(), 3);
    }

    #[test]
    fn test_unknown_and_reserved() {
        let err = PipelineBuilder::linear("D", steps())
            .with_known_types(["a", "b"])
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(msg) if msg.contains("'c'")));

        let bad = vec![
            PipelineStep::new("a")
                .with_parameter(NEXT, json!([]))
                .attach_to("D"),
        ];
        assert!(PipelineBuilder::linear("D", bad).build().is_err());
        assert!(PipelineBuilder::linear("D", vec![]).build().is_err());
    }

    #[test]
    fn test_dataset_parameters_carry_subtree() {
        let pipeline = PipelineBuilder::linear("D", steps()).build().unwrap();
        let parameters = pipeline.roots()[0].dataset_parameters().unwrap();
        let next: Vec<PipelineStep> =
            serde_json::from_value(parameters.get(NEXT).unwrap().clone()).unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next[0].processor_type, "b");
        assert_eq!(next[0].next[0].attach_target(), Some("D"));
    }

    #[test]
    fn test_step_serde_shape() {
        let step: PipelineStep = serde_json::from_value(json!({
            "type": "count-values",
            "parameters": {"field": "board"}
        }))
        .unwrap();
        assert_eq!(step.processor_type, "count-values");
        assert!(step.next.is_empty());
        assert_eq!(
            serde_json::to_value(&step).unwrap(),
            json!({"type": "count-values", "parameters": {"field": "board"}})
        );
    }

    #[tokio::test]
    async fn test_materialize_steps_adds_only_missing_children() {
        let (_dir, services) = crate::test_utils::test_services().await;
        let datasets = &services.datasets;
        let origin = datasets.create(NewDataset::new("preset")).await.unwrap();
        let roots = vec![
            PipelineStep::new("sample-rows").with_parameter("limit", json!(5)),
            PipelineStep::new("count-values")
                .with_parameter("field", json!("kind"))
                .attach_to(&origin.key),
        ];

        // An earlier run got as far as the first root
        datasets
            .create(
                NewDataset::new("sample-rows")
                    .with_parent(&origin.key)
                    .with_parameters(roots[0].dataset_parameters().unwrap()),
            )
            .await
            .unwrap();

        let created = materialize_steps(datasets, &origin, &roots).await.unwrap();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].dataset_type, "count-values");
        assert_eq!(datasets.children(&origin.key).await.unwrap().len(), 2);
        // The surviving root lost its job with the crash and gets it back
        assert_eq!(services.queue.get_job_count(Some("sample-rows")).await.unwrap(), 1);

        let again = materialize_steps(datasets, &origin, &roots).await.unwrap();
        assert!(again.is_empty());
        assert_eq!(datasets.children(&origin.key).await.unwrap().len(), 2);
        assert_eq!(services.queue.get_job_count(None).await.unwrap(), 2);
    }
}
