use std::collections::HashSet;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::agent::toolbox::HarnessToolbox;
use crate::agent::{Agent, ChatMessage, Response};
use crate::analysis::tags::GlobalTags;
use crate::analysis::{retrieve_type, AstParser};
use crate::config::{Config, DEFAULT_SEED, MAX_TURNS, TEMPERATURE};
use crate::depot::Depot;
use crate::execution::Compiler;
use crate::gadget::{ApiGadget, TypeGadget};
use crate::journal::Journal;
use crate::metas::SeedMetas;
use crate::mutation::ApiMutator;
use crate::prompt::{render_signatures, PromptRenderer, AGENT_PROMPT};
use crate::state::State;
use crate::validate::{
    FailureKind, HarnessValidator, Success, ValidationError, Verdict,
};

/// Convergence policy over the persisted state; the baseline accepts the
/// first validated harness.
pub type ConvergenceFn = fn(&State) -> bool;

fn baseline_convergence(state: &State) -> bool {
    state.trial.success > 0
}

/// The outer loop: select a combination, prompt the agent, validate, update
/// the persisted state, repeat until convergence or budget exhaustion.
pub struct HarnessGenerator<'e> {
    config: &'e Config,
    depot: Depot,
    compiler: &'e dyn Compiler,
    parser: &'e dyn AstParser,
    tags: Option<&'e GlobalTags>,
    agent: Agent,
    apis: Vec<ApiGadget>,
    types: Vec<TypeGadget>,
    state: State,
    corpus: PathBuf,
    metas: SeedMetas,
    rng: StdRng,
    converge: ConvergenceFn,
    batch_size: Option<usize>,
    seed: i64,
}

impl<'e> HarnessGenerator<'e> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &'e Config,
        workdir: &Path,
        compiler: &'e dyn Compiler,
        parser: &'e dyn AstParser,
        tags: Option<&'e GlobalTags>,
        apis: Vec<ApiGadget>,
        types: Vec<TypeGadget>,
        load_from_state: bool,
    ) -> Result<Self> {
        let depot = Depot::new(workdir)?;
        let state = match load_from_state {
            true => depot.load_state()?,
            false => None,
        };
        let state = match state {
            Some(state) => {
                log::info!(
                    "restored the state at trial {} (cost ${:.4})",
                    state.trial.trial,
                    state.trial.cost
                );
                state
            }
            None => State {
                trial: Default::default(),
                covered: Default::default(),
                mutator: ApiMutator::new(apis.clone()).with_seed(DEFAULT_SEED as u64),
            },
        };
        let corpus = depot.stage_corpus(config.corpus_dir.as_deref())?;
        let agent = Agent::new()?.with_journal(Journal::new(&depot.log_file("agent.log")));
        Ok(Self {
            config,
            depot,
            compiler,
            parser,
            tags,
            agent,
            apis,
            types,
            state,
            corpus,
            metas: SeedMetas::new(chrono::Utc::now()),
            rng: StdRng::seed_from_u64(DEFAULT_SEED as u64),
            converge: baseline_convergence,
            batch_size: None,
            seed: DEFAULT_SEED,
        })
    }

    /// Reseed every stochastic choice of the run (mutator, prompt sampling,
    /// agent seed).
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self.state.mutator = std::mem::replace(
            &mut self.state.mutator,
            ApiMutator::new(Vec::new()),
        )
        .with_seed(seed);
        self.seed = seed as i64;
        self
    }

    pub fn with_convergence(mut self, converge: ConvergenceFn) -> Self {
        self.converge = converge;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn depot(&self) -> &Depot {
        &self.depot
    }

    /// Run trials until convergence or the cost budget runs out. An agent
    /// error is fatal for the run; every validation failure just advances to
    /// the next trial.
    pub fn run(&mut self) -> Result<()> {
        let validator = HarnessValidator::new(
            self.compiler,
            self.parser,
            self.apis.clone(),
            self.config,
        )
        .with_journal(Journal::new(&self.depot.log_file("validator.log")));

        loop {
            self.depot.persist_state(&self.state)?;
            if self.should_stop() {
                break;
            }

            let (minlen, maxlen) = self.config.comblen;
            let targets = self
                .state
                .mutator
                .select(&self.state.covered.global_, minlen, maxlen);
            for target in &targets {
                self.state.covered.prompted.hit(&target.name);
            }
            let messages = self.render_prompt(&targets);

            let trial_id = self.state.trial.trial;
            let workdir = self.depot.work_dir(trial_id)?;
            let mut toolbox = HarnessToolbox::new(
                &validator,
                self.tags,
                &self.config.srcdir,
                &workdir,
                &self.corpus,
                self.config.fuzzdict.as_deref(),
                self.state.covered.global_.clone(),
                self.batch_size,
            );
            let response = self.agent.run(
                &self.config.llm,
                messages,
                Some(&mut toolbox),
                TEMPERATURE,
                MAX_TURNS,
                self.seed,
            );
            self.state.trial.llm_call += response.turn.map(|turn| turn as u64 + 1).unwrap_or(1);
            self.state.trial.cost += response.billing.unwrap_or(0.0);
            self.state.trial.trial += 1;

            if let Some(error) = response.error.clone() {
                self.state.trial.count_failure(FailureKind::Agent);
                self.depot
                    .preserve_failure(trial_id, FailureKind::Agent, &error, &workdir)?;
                log::error!("agent failed on trial {trial_id}: {error}");
                self.log_trial(trial_id);
                break;
            }

            let failure = toolbox.take_last_failure();
            let verdict = self.resolve_verdict(&validator, &workdir, response, failure)?;
            self.settle(trial_id, &workdir, verdict)?;

            self.state.trial.converged =
                (self.converge)(&self.state) || self.state.mutator.converge();
            self.log_trial(trial_id);
        }

        self.depot.persist_state(&self.state)?;
        if !self.metas.is_empty() {
            self.metas.write_to(&self.depot.metas_file())?;
        }
        Ok(())
    }

    fn should_stop(&self) -> bool {
        if self.state.trial.converged {
            log::info!("converged after {} trials", self.state.trial.trial);
            return true;
        }
        if self.state.trial.cost >= self.config.quota {
            log::info!(
                "cost budget exhausted: ${:.4} >= ${:.4}",
                self.state.trial.cost,
                self.config.quota
            );
            return true;
        }
        false
    }

    /// Reduce an agent response to a validation verdict: a short-circuited
    /// success, the last recorded tool failure, or a validation of the final
    /// plain-text reply.
    fn resolve_verdict(
        &self,
        validator: &HarnessValidator,
        workdir: &Path,
        response: Response,
        last_failure: Option<ValidationError>,
    ) -> Result<Verdict> {
        if let Some(success) = response.validated {
            return Ok(Ok(success));
        }
        if let Some(failure) = last_failure {
            return Ok(Err(failure));
        }
        if let Some(text) = &response.text {
            return validator.validate(
                text,
                &self.state.covered.global_,
                workdir,
                &self.corpus,
                self.config.fuzzdict.as_deref(),
                self.batch_size,
            );
        }
        Ok(Err(ValidationError::Parse {
            response: String::new(),
            description: "the agent returned neither text nor a validated harness".to_string(),
        }))
    }

    /// Fold a verdict into the persisted state and the on-disk layout.
    fn settle(&mut self, trial_id: u64, workdir: &Path, verdict: Verdict) -> Result<()> {
        match verdict {
            Ok(success) => self.accept(trial_id, success),
            Err(err) => {
                self.state.trial.count_failure(err.kind());
                self.depot
                    .preserve_failure(trial_id, err.kind(), &err.to_string(), workdir)?;
                Ok(())
            }
        }
    }

    /// Success path: archive the harness, grow the global coverage, feed the
    /// validated paths back into the mutator as seeds.
    fn accept(&mut self, trial_id: u64, success: Success) -> Result<()> {
        let archived = self.depot.harness_file(trial_id, &self.config.ext);
        std::fs::copy(&success.path, &archived).with_context(|| {
            format!("cannot archive the harness {:?} to {archived:?}", success.path)
        })?;

        self.state.covered.global_.merge(&success.cov_lib);
        for critical_path in &success.validated_paths {
            for (name, _) in critical_path {
                self.state.covered.executed.hit(name);
            }
            self.state
                .mutator
                .append_seeds(&archived, &success.cov_lib, critical_path);
        }
        self.state.trial.success += 1;

        self.metas
            .add(&archived, Some(self.state.covered.global_.coverage_branch()))?;
        self.metas.write_to(&self.depot.metas_file())?;
        log::info!("accepted the harness of trial {trial_id}: {archived:?}");
        Ok(())
    }

    /// Render the instruction prompt: project name, a bounded sample of the
    /// API universe, the types the targets reference, and the combination.
    fn render_prompt(&mut self, targets: &[ApiGadget]) -> Vec<ChatMessage> {
        let mut universe: Vec<String> =
            self.apis.iter().map(ApiGadget::signature).collect();
        if universe.len() > self.config.max_apis {
            universe.shuffle(&mut self.rng);
            universe.truncate(self.config.max_apis);
        }

        let mut seen = HashSet::new();
        let mut types = Vec::new();
        for target in targets {
            for gadget in retrieve_type(target, &self.types) {
                if seen.insert(gadget.signature()) {
                    types.push(gadget.signature());
                }
            }
        }

        let combinations: Vec<String> = targets.iter().map(ApiGadget::signature).collect();
        PromptRenderer::new(AGENT_PROMPT).render(&[
            ("project", self.config.name.clone()),
            ("apis", render_signatures(&universe, "\n")),
            ("context", render_signatures(&types, "\n")),
            (
                "combinations",
                format!("    {}", render_signatures(&combinations, ",\n    ")),
            ),
        ])
    }

    fn log_trial(&self, trial_id: u64) {
        let trial = &self.state.trial;
        log::info!(
            "[trial {trial_id}] success: {}, failure: agent {} / parse {} / compile {} / fuzzer {} / coverage {} / critical_path {}, llm calls: {}, cost: ${:.4}, global branch coverage: {:.2}%",
            trial.success,
            trial.failure_agent,
            trial.failure_parse,
            trial.failure_compile,
            trial.failure_fuzzer,
            trial.failure_coverage,
            trial.failure_critical_path,
            trial.llm_call,
            trial.cost,
            self.state.covered.global_.coverage_branch() * 100.0,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::CriticalPath;
    use crate::coverage::Coverage;
    use crate::execution::{BatchConfig, BatchOutcome, CovScope, Fuzzer, RunConfig};
    use std::sync::mpsc;

    struct NullFuzzer;

    impl Fuzzer for NullFuzzer {
        fn minimize(&self, _corpus: &Path, _outdir: Option<&Path>) -> Result<Option<PathBuf>> {
            Ok(None)
        }
        fn run(&mut self, _config: &RunConfig) -> Result<Option<i32>> {
            Ok(None)
        }
        fn poll(&mut self) -> Result<Option<i32>> {
            Ok(Some(0))
        }
        fn halt(&mut self) -> Result<()> {
            Ok(())
        }
        fn clear(&mut self) -> Result<()> {
            Ok(())
        }
        fn track(&self) -> u64 {
            0
        }
        fn coverage(&self, _scope: CovScope, _profile: Option<&Path>) -> Result<Coverage> {
            Ok(Coverage::new())
        }
        fn batch_run(
            &self,
            _corpus_dirs: Vec<PathBuf>,
            _config: &BatchConfig,
        ) -> Result<mpsc::Receiver<BatchOutcome>> {
            let (_, receiver) = mpsc::channel();
            Ok(receiver)
        }
    }

    struct NullCompiler;

    impl Compiler for NullCompiler {
        fn compile(&self, _srcfile: &Path, _workdir: &Path) -> Result<Box<dyn Fuzzer>> {
            Ok(Box::new(NullFuzzer))
        }
    }

    struct NullParser;

    impl AstParser for NullParser {
        fn parse_api_gadget(&self, _source: &Path) -> Result<Vec<ApiGadget>> {
            Ok(Vec::new())
        }
        fn parse_type_gadget(&self, _source: &Path) -> Result<Vec<TypeGadget>> {
            Ok(Vec::new())
        }
        fn extract_critical_path(
            &self,
            _source: &Path,
            _gadgets: &[ApiGadget],
            _target: Option<&str>,
        ) -> Result<Vec<CriticalPath>> {
            Ok(Vec::new())
        }
    }

    fn apis() -> Vec<ApiGadget> {
        vec![
            ApiGadget::new("f", "int", vec![]),
            ApiGadget::new("g", "void", vec![(Some("n".into()), "int".into())]),
        ]
    }

    fn generator<'e>(
        config: &'e Config,
        workdir: &Path,
        compiler: &'e NullCompiler,
        parser: &'e NullParser,
    ) -> HarnessGenerator<'e> {
        if let Some(corpus_dir) = config.corpus_dir.as_ref() {
            std::fs::create_dir_all(corpus_dir).unwrap();
        }
        HarnessGenerator::new(
            config,
            workdir,
            compiler,
            parser,
            None,
            apis(),
            vec![TypeGadget::new(
                "int",
                crate::gadget::TypeTag::Alias,
                Some("int32_t"),
            )],
            false,
        )
        .unwrap()
        .with_seed(7)
    }

    fn success_fixture(workdir: &Path) -> Success {
        let source = workdir.join("source.cc");
        std::fs::write(&source, "int harness;").unwrap();
        let mut cov_lib = Coverage::new();
        cov_lib
            .functions
            .entry("f".into())
            .or_default()
            .insert("B0".into(), 1);
        Success {
            path: source,
            cov_lib,
            cov_fuzz: Coverage::new(),
            validated_paths: vec![vec![("f".to_string(), Some(1))]],
        }
    }

    #[test]
    fn test_settle_success_updates_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let (compiler, parser) = (NullCompiler, NullParser);
        let mut generator = generator(&config, &dir.path().join("workspace"), &compiler, &parser);

        let workdir = generator.depot.work_dir(0)?;
        let success = success_fixture(&workdir);
        generator.settle(0, &workdir, Ok(success))?;

        let state = generator.state();
        assert_eq!(state.trial.success, 1);
        assert_eq!(state.covered.global_.functions["f"]["B0"], 1);
        assert!(state.covered.executed.contains("f"));
        assert_eq!(state.mutator.seeds().len(), 1);
        assert!(generator.depot.harness_file(0, "cc").exists());
        assert!(generator.depot.metas_file().exists());
        Ok(())
    }

    #[test]
    fn test_settle_failure_preserves_workdir() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let (compiler, parser) = (NullCompiler, NullParser);
        let mut generator = generator(&config, &dir.path().join("workspace"), &compiler, &parser);

        let workdir = generator.depot.work_dir(0)?;
        std::fs::write(workdir.join("source.cc"), "broken")?;
        let err = ValidationError::Compile {
            path: workdir.join("source.cc"),
            stderr: "undefined reference".into(),
            trace: String::new(),
        };
        generator.settle(0, &workdir, Err(err))?;

        assert_eq!(generator.state().trial.failure_compile, 1);
        let preserved = generator
            .depot
            .root()
            .join("exceptions/failure_compile/0/failure_compile.txt");
        assert!(preserved.exists());
        assert!(std::fs::read_to_string(preserved)?.contains("undefined reference"));
        Ok(())
    }

    #[test]
    fn test_budget_exhaustion_stops_without_convergence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut config = Config::test(dir.path());
        config.quota = 0.001;
        let (compiler, parser) = (NullCompiler, NullParser);
        let mut generator = generator(&config, &dir.path().join("workspace"), &compiler, &parser);

        generator.state.trial.cost = 0.01;
        assert!(generator.should_stop());
        assert!(!generator.state().trial.converged);
        Ok(())
    }

    #[test]
    fn test_baseline_convergence() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let (compiler, parser) = (NullCompiler, NullParser);
        let mut generator = generator(&config, &dir.path().join("workspace"), &compiler, &parser);

        assert!(!baseline_convergence(generator.state()));
        let workdir = generator.depot.work_dir(0)?;
        let success = success_fixture(&workdir);
        generator.settle(0, &workdir, Ok(success))?;
        assert!(baseline_convergence(generator.state()));
        Ok(())
    }

    #[test]
    fn test_resume_restores_state() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let (compiler, parser) = (NullCompiler, NullParser);
        let workspace = dir.path().join("workspace");
        let snapshot = {
            let mut generator = generator(&config, &workspace, &compiler, &parser);
            let workdir = generator.depot.work_dir(0)?;
            let success = success_fixture(&workdir);
            generator.settle(0, &workdir, Ok(success))?;
            generator.state.trial.trial = 1;
            generator.depot.persist_state(generator.state())?;
            generator.state().clone()
        };

        let resumed = HarnessGenerator::new(
            &config, &workspace, &compiler, &parser, None, apis(), vec![], true,
        )?;
        assert_eq!(resumed.state().trial, snapshot.trial);
        assert_eq!(resumed.state().covered, snapshot.covered);
        assert_eq!(
            resumed.state().mutator.seeds(),
            snapshot.mutator.seeds()
        );
        Ok(())
    }

    #[test]
    fn test_resolve_verdict_prefers_short_circuit() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let (compiler, parser) = (NullCompiler, NullParser);
        let generator = generator(&config, &dir.path().join("workspace"), &compiler, &parser);
        let validator = HarnessValidator::new(&compiler, &parser, apis(), &config);

        let workdir = generator.depot.work_dir(0)?;
        let success = success_fixture(&workdir);
        let response = Response {
            validated: Some(success),
            ..Response::default()
        };
        let failure = ValidationError::Parse {
            response: String::new(),
            description: "stale".into(),
        };
        let verdict = generator.resolve_verdict(&validator, &workdir, response, Some(failure))?;
        assert!(verdict.is_ok());

        // neither text nor success resolves to a parse failure
        let verdict =
            generator.resolve_verdict(&validator, &workdir, Response::default(), None)?;
        assert_eq!(verdict.unwrap_err().kind(), FailureKind::Parse);
        Ok(())
    }

    #[test]
    fn test_render_prompt_binds_all_placeholders() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = Config::test(dir.path());
        let (compiler, parser) = (NullCompiler, NullParser);
        let mut generator = generator(&config, &dir.path().join("workspace"), &compiler, &parser);

        let targets = apis();
        let messages = generator.render_prompt(&targets);
        assert_eq!(messages.len(), 2);
        let system = messages[0].content.as_deref().unwrap();
        assert!(system.contains("cjson"));
        assert!(system.contains("int f()"));
        // the target's argument type pulls its alias into the context
        assert!(system.contains("typedef int32_t int;"));
        assert!(!system.contains("{{"));
        let user = messages[1].content.as_deref().unwrap();
        assert!(user.contains("int f(),\n    void g(int n)"));
        Ok(())
    }
}
