//! Repair loop: build → pick the first diagnostic → ask the model → patch →
//! rebuild → keep or revert.
//!
//! One session drives one working copy, strictly sequentially. Every accepted
//! iteration is committed; rejected ones are restored from the last commit.
//! Retries live inside the build runner and the model collaborator, never here.

use std::path::{Component, Path, PathBuf};
use std::time::Instant;

use coordination::feedback::observation::code_snippet;
use coordination::parser::render_feedback;
use coordination::{
    normalize_line_endings, BuildError, BuildObservation, BuildRunner, BuildTool,
    BuildToolRegistry, ChangeComparator, CommandRunner, ContextRequestParser, EditApplier,
    ExampleStore, ExtractError, GitManager, GroupedParser, Message, ModelCallKind, PatchApplier,
    PatchError, Trajectory, TrajectoryError, VcsError, VersionControl,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::MendConfig;
use crate::model::{ChatModel, ModelError, OpenAiChatModel, RetryingModel};
use crate::prompts::{PromptBuilder, RepairContext, PROMPT_VERSION};
use crate::reflection::{reflection_prompt, Reflection};
use crate::rules::RuleSet;
use crate::state_machine::{IllegalTransition, SessionState, StateMachine, TransitionRecord};
use crate::validator::{ValidationReport, Validator, DEPRECATION_COUNT_UNAVAILABLE};

/// Feedback when a response parsed cleanly but carried no edits.
const NO_EDITS_FEEDBACK: &str = "No find/replace blocks were found in the response.";

/// Feedback when edits were parsed but none could be applied.
const NOT_APPLIED_FEEDBACK: &str = "None of the suggested changes could be applied.";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Build failed: {0}")]
    Build(#[from] BuildError),

    #[error("Extraction failed: {0}")]
    Extract(#[from] ExtractError),

    #[error("Patch failed: {0}")]
    Patch(#[from] PatchError),

    #[error("Model failed: {0}")]
    Model(#[from] ModelError),

    #[error("Version control failed: {0}")]
    Vcs(#[from] VcsError),

    #[error("Rule failed: {0}")]
    Rule(#[from] std::io::Error),

    #[error("Trajectory failed: {0}")]
    Trajectory(#[from] TrajectoryError),

    #[error("Invalid response markers: {0}")]
    Markers(#[from] regex::Error),

    #[error(transparent)]
    State(#[from] IllegalTransition),
}

impl SessionError {
    /// Whether the session must stop. Model and git hiccups are survivable.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Model(e) => e.is_unrecoverable(),
            Self::Vcs(e) => matches!(e, VcsError::Io(_)),
            _ => true,
        }
    }
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Everything the loop talks to.
pub struct Collaborators {
    pub runner: Box<dyn BuildRunner>,
    pub tool: BuildTool,
    pub model: Box<dyn ChatModel>,
    pub vcs: Box<dyn VersionControl>,
    pub applier: Box<dyn EditApplier>,
}

impl Collaborators {
    /// Real implementations for a working copy at `root`.
    pub fn production(root: &Path, config: &MendConfig) -> SessionResult<Self> {
        let tool = BuildToolRegistry::new().create(&config.build.tool, root)?;
        let command = config
            .build
            .command
            .clone()
            .unwrap_or_else(|| tool.default_build_command().to_string());
        let model = OpenAiChatModel::new(config.model.clone())?;

        Ok(Self {
            runner: Box::new(CommandRunner::new(command, root, config.build.runner.clone())),
            model: Box::new(RetryingModel::new(model, config.model.retry.clone())),
            vcs: Box::new(GitManager::new(root)),
            applier: Box::new(PatchApplier::new(root, config.build.patch.clone())),
            tool,
        })
    }
}

/// Final account of a session, printed as JSON by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionReport {
    pub outcome: SessionState,
    /// Build fixed and every configured validation passed.
    pub success: bool,
    pub iterations: u32,
    pub initial_errors: usize,
    pub residual_errors: usize,
    pub commits: usize,
    pub reverts: usize,
    pub examples: usize,
    /// `-1` when the probe did not run or could not produce a count.
    pub deprecated_api_count: i64,
    pub validation: ValidationReport,
    pub trajectory_path: Option<PathBuf>,
    pub state_summary: String,
    pub transitions: Vec<TransitionRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Conversation carried from a rejected response into the next iteration.
#[derive(Debug, Default)]
struct Conversation {
    history: Vec<Message>,
    feedback: Vec<String>,
}

impl Conversation {
    fn reject(&mut self, exchange: Exchange, cleaned: String, feedback: Vec<String>) {
        let mut history = exchange.history;
        history.push(Message::user(exchange.prompt));
        history.push(Message::assistant(cleaned));
        self.history = history;
        self.feedback = feedback;
    }

    fn clear(&mut self) {
        self.history.clear();
        self.feedback.clear();
    }
}

/// The final prompt/response of one iteration and the history it was sent with.
struct Exchange {
    history: Vec<Message>,
    prompt: String,
    response: String,
}

pub struct RepairSession {
    root: PathBuf,
    config: MendConfig,
    collab: Collaborators,
    rules: RuleSet,
    parser: GroupedParser,
    context_parser: ContextRequestParser,
    prompts: PromptBuilder,
    comparator: ChangeComparator,
    examples: ExampleStore,
    trajectory: Trajectory,
    state: StateMachine,
    initial_errors: usize,
    residual_errors: usize,
}

impl RepairSession {
    pub fn new(root: impl AsRef<Path>, config: MendConfig, collab: Collaborators) -> SessionResult<Self> {
        let root = root.as_ref().to_path_buf();
        let parser = GroupedParser::new(&config.parser)?.with_root(Some(root.clone()));
        let context_parser = ContextRequestParser::new(&config.parser)?;
        let prompts = PromptBuilder::new(config.parser.clone())
            .with_context_requests(config.session.max_context_rounds > 0);
        let comparator = ChangeComparator::new(config.build.policy, collab.tool.project_suffix())
            .enabled(config.build.compare_builds);

        Ok(Self {
            rules: RuleSet::for_tool(&collab.tool),
            examples: ExampleStore::new(config.session.max_examples.max(1)),
            trajectory: Trajectory::new(&root),
            state: StateMachine::new(),
            initial_errors: 0,
            residual_errors: 0,
            root,
            config,
            collab,
            parser,
            context_parser,
            prompts,
            comparator,
        })
    }

    pub fn with_rules(mut self, rules: RuleSet) -> Self {
        self.rules = rules;
        self
    }

    /// Drive the session to a terminal state. Never fails: errors end the
    /// session in `Fatal` and are reported.
    pub async fn run(mut self) -> SessionReport {
        let started = Instant::now();
        let (outcome, error) = match self.drive(started).await {
            Ok(outcome) => (outcome, None),
            Err(e) => {
                error!(iteration = self.state.iteration(), error = %e, "Session failed");
                if let Err(illegal) = self.state.fail(&e.to_string()) {
                    warn!(error = %illegal, "Could not record failure transition");
                }
                (SessionState::Fatal, Some(e.to_string()))
            }
        };
        self.finish(outcome, error).await
    }

    async fn drive(&mut self, started: Instant) -> SessionResult<SessionState> {
        // Init
        if self.rules.apply_one_off(&self.root)? {
            info!("One-off rules changed the working copy");
        }
        self.commit(0, "Iteration 0 (one-off): Apply rules before measuring the build.")?;
        self.state.advance(SessionState::PreBuild, None)?;

        // PreBuild
        let mut diagnostics = self.measure().await?;
        let before = diagnostics.len();
        self.initial_errors = before;

        let mut rounds = 0;
        while !diagnostics.is_empty()
            && rounds < self.config.session.max_rule_rounds
            && self.rules.apply_zero_cost(&self.root, &diagnostics)?
        {
            rounds += 1;
            diagnostics = self.measure().await?;
            info!(round = rounds, errors = diagnostics.len(), "Applied zero-cost rules");
        }
        if rounds > 0 {
            let message = format!(
                "Iteration 0 (rules): Build errors # = {} <== {}.",
                diagnostics.len(),
                before
            );
            self.commit(0, &message)?;
        }
        self.residual_errors = diagnostics.len();
        self.state.note_errors(diagnostics.len());
        self.trajectory.record_build(0, &diagnostics);

        if diagnostics.is_empty() {
            self.state.advance(SessionState::Succeeded, Some("build passes"))?;
            return Ok(SessionState::Succeeded);
        }

        let budget = self.config.session.effective_iterations(diagnostics.len());
        info!(errors = diagnostics.len(), budget, policy = %self.comparator.policy(), "Baseline measured");
        if budget == 0 {
            self.state.advance(SessionState::Exhausted, Some("zero iteration budget"))?;
            return Ok(SessionState::Exhausted);
        }
        self.state
            .advance(SessionState::Iterating, Some(&format!("{} errors", diagnostics.len())))?;

        // Iterating
        let ceiling = self.config.session.wall_clock();
        let mut convo = Conversation::default();
        for iteration in 1..=budget {
            if started.elapsed() >= ceiling {
                warn!(iteration, secs = ceiling.as_secs(), "Wall-clock ceiling reached");
                self.state.advance(SessionState::Exhausted, Some("wall-clock ceiling"))?;
                return Ok(SessionState::Exhausted);
            }
            self.state.set_iteration(iteration);

            let result = self.iterate(iteration, &diagnostics, &mut convo).await;
            diagnostics = match result {
                Ok(latest) => latest,
                Err(e) if e.is_fatal() => {
                    self.remeasure_after_failure(iteration).await;
                    return Err(e);
                }
                Err(e) => {
                    warn!(iteration, error = %e, "Iteration failed, re-measuring");
                    convo.clear();
                    match self.recover().await {
                        Ok(latest) => latest,
                        Err(e) => {
                            self.remeasure_after_failure(iteration).await;
                            return Err(e);
                        }
                    }
                }
            };
            self.residual_errors = diagnostics.len();
            self.state.note_errors(diagnostics.len());
            self.trajectory.record_build(iteration, &diagnostics);

            if diagnostics.is_empty() {
                self.state.advance(SessionState::Succeeded, None)?;
                return Ok(SessionState::Succeeded);
            }
        }

        self.state.advance(SessionState::Exhausted, Some("iteration budget"))?;
        Ok(SessionState::Exhausted)
    }

    /// One repair attempt. Returns the diagnostics the next iteration works on.
    async fn iterate(
        &mut self,
        iteration: u32,
        diagnostics: &[BuildObservation],
        convo: &mut Conversation,
    ) -> SessionResult<Vec<BuildObservation>> {
        let Some(first) = diagnostics.first() else {
            return Ok(Vec::new());
        };
        let target = self.prepare_target(iteration, first)?;
        info!(iteration, errors = diagnostics.len(), target = %target, "Starting iteration");

        let exchange = self.converse(iteration, &target, convo).await?;
        let outcome = self.parser.parse(&exchange.response);
        let cleaned = match outcome.transcript.is_empty() {
            true => exchange.response.trim().to_string(),
            false => outcome.transcript.clone(),
        };

        if !outcome.is_usable() {
            let mut feedback = outcome.feedback;
            if feedback.is_empty() {
                feedback.push(NO_EDITS_FEEDBACK.to_string());
            }
            info!(iteration, feedback = feedback.len(), "Response not usable");
            convo.reject(exchange, cleaned, feedback);
            return Ok(diagnostics.to_vec());
        }

        let applied = self.collab.applier.apply(&outcome.edits)?;
        debug!(iteration, files = ?applied.modified_files(), "Applied edits");
        if !applied.any_applied() {
            let mut feedback = applied.feedback;
            if feedback.is_empty() {
                feedback.push(NOT_APPLIED_FEEDBACK.to_string());
            }
            self.revert(iteration, feedback.clone())?;
            convo.reject(exchange, cleaned, feedback);
            return Ok(diagnostics.to_vec());
        }

        let latest = self.measure().await?;
        let verdict = self.comparator.compare(diagnostics, &latest);
        if verdict.is_accepted() {
            let message = format!(
                "Iteration {}: Build errors # = {} <== {}.\n\n{}",
                iteration,
                latest.len(),
                diagnostics.len(),
                target
            );
            self.commit(iteration, &message)?;
            self.examples
                .record(target.code.as_deref(), &target.message, &outcome.transcript);
            convo.clear();
            return Ok(latest);
        }

        info!(
            iteration,
            reason = ?verdict.rejected,
            before = diagnostics.len(),
            after = latest.len(),
            "Change rejected"
        );
        let mut feedback = applied.feedback;
        feedback.extend(verdict.feedback);
        self.revert(iteration, feedback.clone())?;
        convo.reject(exchange, cleaned, feedback);
        Ok(diagnostics.to_vec())
    }

    /// Normalize the target file's line endings and fill in its snippet.
    fn prepare_target(&mut self, iteration: u32, first: &BuildObservation) -> SessionResult<BuildObservation> {
        let mut target = first.clone();
        let Some(path) = target.file.as_deref().map(|f| self.resolve(f)) else {
            return Ok(target);
        };
        if !path.is_file() {
            return Ok(target);
        }

        if self.config.session.normalize_line_endings && normalize_line_endings(&path)? {
            self.commit(iteration, &format!("nit: Normalize line endings at iteration {iteration}"))?;
        }
        if target.snippet.is_none() {
            if let Some(line) = target.line {
                target.snippet = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|contents| code_snippet(&contents, line));
            }
        }
        Ok(target)
    }

    /// Build the prompt, call the model and serve bounded context requests.
    async fn converse(
        &mut self,
        iteration: u32,
        target: &BuildObservation,
        convo: &Conversation,
    ) -> SessionResult<Exchange> {
        let restart = convo.history.len() > self.config.session.restart_history_len;
        let (mut prompt, mut history) = match render_feedback(&convo.feedback) {
            Some(feedback) if !restart && !convo.history.is_empty() => {
                (self.prompts.correction_prompt(&feedback), convo.history.clone())
            }
            _ => (self.fresh_prompt(iteration, target).await?, Vec::new()),
        };

        let max_rounds = self.config.session.max_context_rounds;
        let max_files = self.config.session.max_context_files;
        let mut attached: Vec<(PathBuf, String)> = Vec::new();
        let mut round = 0;

        loop {
            debug!(iteration, round, prompt_version = PROMPT_VERSION, "Calling model");
            let response = self.collab.model.generate(&prompt, &history).await?;

            let requested = self.context_parser.parse(&response);
            let wants_context = !requested.is_empty()
                && round < max_rounds
                && attached.len() < max_files
                && self.parser.parse(&response).edits.is_empty();
            if !wants_context {
                self.trajectory.record_model(
                    iteration,
                    ModelCallKind::Repair,
                    prompt.clone(),
                    history.clone(),
                    response.clone(),
                );
                return Ok(Exchange {
                    history,
                    prompt,
                    response,
                });
            }

            self.trajectory.record_model(
                iteration,
                ModelCallKind::ContextRequest,
                prompt.clone(),
                history.clone(),
                response.clone(),
            );
            round += 1;
            let (found, missing) = self.collect_context(&requested, &attached, max_files - attached.len());
            info!(iteration, round, found = found.len(), missing = missing.len(), "Serving context request");

            history.push(Message::user(std::mem::take(&mut prompt)));
            history.push(Message::assistant(response));
            prompt = self.prompts.context_reply(&found, &missing);
            attached.extend(found);
        }
    }

    async fn fresh_prompt(&mut self, iteration: u32, target: &BuildObservation) -> SessionResult<String> {
        let reflection = match self.config.session.reflection {
            true => self.reflect(iteration, target).await?,
            false => None,
        };
        let examples = self.examples.select(
            target.code.as_deref(),
            &target.message,
            self.config.session.max_examples,
        );
        let descriptor = target
            .project
            .clone()
            .unwrap_or_else(|| self.collab.tool.project_descriptor());
        let project = descriptor
            .strip_prefix(&self.root)
            .map(Path::to_path_buf)
            .unwrap_or(descriptor);
        Ok(self.prompts.repair_prompt(&RepairContext {
            target: Some(target),
            examples,
            reflection,
            project: Some(project),
        }))
    }

    /// Ask for an analysis of the last failed attempt at this diagnostic.
    async fn reflect(&mut self, iteration: u32, target: &BuildObservation) -> SessionResult<Option<String>> {
        let Some(prior) = self.trajectory.prior_response_for(target).map(str::to_string) else {
            return Ok(None);
        };
        let prompt = reflection_prompt(target, &prior);
        let response = self.collab.model.generate(&prompt, &[]).await?;
        self.trajectory.record_model(
            iteration,
            ModelCallKind::Reflection,
            prompt,
            Vec::new(),
            response.clone(),
        );
        let reflection = Reflection::parse(&response).map(|r| r.render());
        debug!(iteration, reflected = reflection.is_some(), "Reflected on earlier attempt");
        Ok(reflection)
    }

    /// Read requested files, up to `limit` new ones. A missing path is
    /// searched by file name under its nearest existing ancestor.
    fn collect_context(
        &self,
        requested: &[PathBuf],
        attached: &[(PathBuf, String)],
        limit: usize,
    ) -> (Vec<(PathBuf, String)>, Vec<PathBuf>) {
        let mut found: Vec<(PathBuf, String)> = Vec::new();
        let mut missing = Vec::new();

        for path in requested {
            if found.len() >= limit {
                break;
            }
            if path.components().any(|c| matches!(c, Component::ParentDir)) {
                missing.push(path.clone());
                continue;
            }
            let candidate = self.resolve(path);
            let resolved = if candidate.is_file() {
                Some(candidate)
            } else {
                self.search_by_name(&candidate)
            };
            let Some(resolved) = resolved.filter(|p| p.starts_with(&self.root)) else {
                missing.push(path.clone());
                continue;
            };

            let relative = resolved.strip_prefix(&self.root).unwrap_or(&resolved).to_path_buf();
            let seen = attached.iter().chain(found.iter()).any(|(p, _)| *p == relative);
            if seen {
                continue;
            }
            match std::fs::read_to_string(&resolved) {
                Ok(content) => found.push((relative, content)),
                Err(e) => {
                    debug!(file = %resolved.display(), error = %e, "Unreadable context file");
                    missing.push(path.clone());
                }
            }
        }
        (found, missing)
    }

    fn search_by_name(&self, missing: &Path) -> Option<PathBuf> {
        let name = missing.file_name()?;
        let ancestor = missing
            .ancestors()
            .skip(1)
            .filter(|a| a.starts_with(&self.root))
            .find(|a| a.is_dir())?;
        let mut matches: Vec<PathBuf> = ignore::WalkBuilder::new(ancestor)
            .build()
            .flatten()
            .filter(|e| e.file_type().is_some_and(|t| t.is_file()) && e.file_name() == name)
            .map(|e| e.into_path())
            .collect();
        matches.sort();
        if matches.len() > 1 {
            debug!(file = ?name, candidates = matches.len(), "Several files share the requested name");
        }
        matches.into_iter().next()
    }

    fn resolve(&self, file: &Path) -> PathBuf {
        match file.is_relative() {
            true => self.root.join(file),
            false => file.to_path_buf(),
        }
    }

    async fn measure(&self) -> SessionResult<Vec<BuildObservation>> {
        let output = self.collab.runner.run().await?;
        let diagnostics = self.collab.tool.extract(&output)?;
        debug!(errors = diagnostics.len(), exit_code = ?output.exit_code, "Measured build");
        Ok(diagnostics)
    }

    /// Drop a failed attempt and measure what is left.
    async fn recover(&self) -> SessionResult<Vec<BuildObservation>> {
        self.collab.vcs.restore()?;
        self.measure().await
    }

    /// Restore and rebuild once so the report reflects the working copy.
    async fn remeasure_after_failure(&mut self, iteration: u32) {
        if let Err(e) = self.collab.vcs.restore() {
            warn!(iteration, error = %e, "Restore after failure failed");
        }
        match self.measure().await {
            Ok(diagnostics) => {
                self.residual_errors = diagnostics.len();
                self.state.note_errors(diagnostics.len());
                self.trajectory.record_build(iteration, &diagnostics);
            }
            Err(e) => warn!(iteration, error = %e, "Re-measure after failure failed"),
        }
    }

    fn commit(&mut self, iteration: u32, message: &str) -> SessionResult<bool> {
        let committed = self.collab.vcs.commit_all(message)?;
        if committed {
            info!(iteration, message = message.lines().next().unwrap_or_default(), "Committed");
            self.trajectory.record_commit(iteration, message);
        }
        Ok(committed)
    }

    fn revert(&mut self, iteration: u32, feedback: Vec<String>) -> SessionResult<()> {
        self.collab.vcs.restore()?;
        info!(iteration, feedback = feedback.len(), "Reverted working copy");
        self.trajectory.record_revert(iteration, feedback);
        Ok(())
    }

    async fn finish(self, outcome: SessionState, error: Option<String>) -> SessionReport {
        let validation = match outcome {
            SessionState::Fatal => ValidationReport::default(),
            _ => {
                Validator::new(self.config.validation.clone(), &self.root)
                    .validate(&self.collab.tool, self.collab.vcs.as_ref())
                    .await
            }
        };

        let iterations = self.state.iteration();
        let trajectory_path = match self.trajectory.save() {
            Ok(path) => Some(path),
            Err(e) => {
                warn!(error = %e, "Failed to save trajectory");
                None
            }
        };
        if trajectory_path.is_some() && self.config.session.commit_trajectory {
            let message = format!("nit: Add trajectory file at iteration {iterations}");
            if let Err(e) = self.collab.vcs.commit_all(&message) {
                warn!(error = %e, "Failed to commit trajectory");
            }
        }

        let success = outcome == SessionState::Succeeded && validation.passed();
        let report = SessionReport {
            outcome,
            success,
            iterations,
            initial_errors: self.initial_errors,
            residual_errors: self.residual_errors,
            commits: self.trajectory.commit_count(),
            reverts: self.trajectory.revert_count(),
            examples: self.examples.len(),
            deprecated_api_count: validation
                .deprecated_api_count
                .unwrap_or(DEPRECATION_COUNT_UNAVAILABLE),
            validation,
            trajectory_path,
            state_summary: self.state.summary(),
            transitions: self.state.transitions().to_vec(),
            error,
        };
        info!(
            outcome = %report.outcome,
            success = report.success,
            iterations = report.iterations,
            initial = report.initial_errors,
            residual = report.residual_errors,
            "Session finished"
        );
        report
    }
}
