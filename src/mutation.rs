use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::analysis::PathStep;
use crate::config::DEFAULT_SEED;
use crate::coverage::Coverage;
use crate::gadget::ApiGadget;

/// Number of gadgets an insert/replace/crossover operator touches.
const MUTATE_CHANGES: usize = 3;

/// Pluggable seed-density score; the baseline keeps it constant.
pub type DensityFn = fn(&Path, &Coverage) -> f64;

fn default_density(_path: &Path, _cov: &Coverage) -> f64 {
    1.0
}

fn default_rng() -> StdRng {
    StdRng::seed_from_u64(DEFAULT_SEED as u64)
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiCounter {
    /// How many times the gadget was rendered into a prompt.
    pub prompt: u64,
    /// How many validated harnesses name the gadget on a critical path.
    pub seed: u64,
}

/// A validated harness recorded for later mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedEntry {
    pub quality: f64,
    pub critical_path: Vec<PathStep>,
    pub source: PathBuf,
}

/// Energy-driven scheduler over the API universe.
///
/// Unexplored APIs carry the highest energy; repeatedly prompted or
/// successfully seeded ones decay. All randomness flows through the injected
/// rng, so runs with the same seed reproduce the same selections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiMutator {
    gadgets: Vec<ApiGadget>,
    /// {signature: counters}; every gadget has an entry.
    counter: HashMap<String, ApiCounter>,
    seeds: Vec<SeedEntry>,
    exponent: f64,
    #[serde(skip, default = "default_rng")]
    rng: StdRng,
    #[serde(skip, default = "default_density_fn")]
    density: DensityFn,
}

fn default_density_fn() -> DensityFn {
    default_density
}

impl ApiMutator {
    pub fn new(gadgets: Vec<ApiGadget>) -> Self {
        let counter = gadgets
            .iter()
            .map(|gadget| (gadget.signature(), ApiCounter::default()))
            .collect();
        Self {
            gadgets,
            counter,
            seeds: Vec::new(),
            exponent: 1.0,
            rng: default_rng(),
            density: default_density,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    pub fn with_density(mut self, density: DensityFn) -> Self {
        self.density = density;
        self
    }

    pub fn gadgets(&self) -> &[ApiGadget] {
        &self.gadgets
    }

    pub fn counter(&self, gadget: &ApiGadget) -> Option<&ApiCounter> {
        self.counter.get(&gadget.signature())
    }

    pub fn seeds(&self) -> &[SeedEntry] {
        &self.seeds
    }

    /// Select the next API combination w.r.t. the energies and the seed bank.
    pub fn select(&mut self, coverage: &Coverage, _minlen: usize, maxlen: usize) -> Vec<ApiGadget> {
        let energies = self.energies(coverage);
        let det = (self.seeds.len() as f64 / 100.0).min(0.8);
        let chosen = if !self.seeds.is_empty() && self.rng.gen::<f64>() < det {
            self.mutate_from_seeds(&energies, maxlen)
        } else {
            self.highest_energies(&energies, maxlen)
        };
        for index in &chosen {
            let signature = self.gadgets[*index].signature();
            if let Some(counter) = self.counter.get_mut(&signature) {
                counter.prompt += 1;
            }
        }
        chosen
            .into_iter()
            .map(|index| self.gadgets[index].clone())
            .collect()
    }

    /// Record a validated harness into the seed bank.
    pub fn append_seeds(&mut self, path: &Path, cov: &Coverage, critical_path: &[PathStep]) {
        let density = (self.density)(path, cov);
        let unique_branches = cov.flat(true).len();
        let quality = density * (1.0 + unique_branches as f64);

        // one seed-count bump per harness, not per occurrence
        let named: HashSet<&str> = critical_path.iter().map(|(name, _)| name.as_str()).collect();
        for gadget in &self.gadgets {
            if named.contains(gadget.name.as_str()) {
                if let Some(counter) = self.counter.get_mut(&gadget.signature()) {
                    counter.seed += 1;
                }
            }
        }
        self.seeds.push(SeedEntry {
            quality,
            critical_path: critical_path.to_vec(),
            source: path.to_path_buf(),
        });
    }

    /// The baseline mutation policy never converges on its own; convergence
    /// is the controller's call.
    pub fn converge(&self) -> bool {
        false
    }

    pub fn dump(&self, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)
            .with_context(|| format!("cannot create the mutator dump {path:?}"))?;
        serde_json::to_writer(file, self)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)
            .with_context(|| format!("cannot open the mutator dump {path:?}"))?;
        Ok(serde_json::from_reader(file)?)
    }

    ///// internal methods, all in gadget-index space

    fn energies(&self, coverage: &Coverage) -> Vec<f64> {
        self.gadgets
            .iter()
            .map(|gadget| {
                let counter = self
                    .counter
                    .get(&gadget.signature())
                    .cloned()
                    .unwrap_or_default();
                let cov = coverage.cover_branch(&gadget.name).unwrap_or(0.0);
                let decay = ((1 + counter.seed) * (1 + counter.prompt)) as f64;
                (1.0 - cov) / decay.powf(self.exponent)
            })
            .collect()
    }

    /// Group gadget indices by energy, descending.
    fn group_energies(&self, energies: &[f64], members: &[usize]) -> Vec<(f64, Vec<usize>)> {
        let mut ordered: Vec<usize> = members.to_vec();
        ordered.sort_by(|a, b| energies[*b].total_cmp(&energies[*a]));
        let mut grouped: Vec<(f64, Vec<usize>)> = Vec::new();
        for index in ordered {
            match grouped.last_mut() {
                Some((energy, bin)) if *energy == energies[index] => bin.push(index),
                _ => grouped.push((energies[index], vec![index])),
            }
        }
        grouped
    }

    /// Top-`len` gadgets by energy, random tie-breaking within equal bins.
    fn highest_energies(&mut self, energies: &[f64], len: usize) -> Vec<usize> {
        let members: Vec<usize> = (0..self.gadgets.len()).collect();
        let grouped = self.group_energies(energies, &members);
        let mut sampled = Vec::new();
        let mut remaining = len;
        for (_, mut bin) in grouped {
            if bin.len() <= remaining {
                remaining -= bin.len();
                sampled.extend(bin);
                continue;
            }
            bin.shuffle(&mut self.rng);
            sampled.extend(bin.into_iter().take(remaining));
            break;
        }
        sampled
    }

    fn mutate_from_seeds(&mut self, energies: &[f64], maxlen: usize) -> Vec<usize> {
        let base = self.sample_apis_from_seed();
        match self.rng.gen_range(0..3) {
            0 => self.insert(base, energies, maxlen, MUTATE_CHANGES),
            1 => {
                let trimmed = self.remove(base, energies, MUTATE_CHANGES);
                self.insert(trimmed, energies, maxlen, MUTATE_CHANGES)
            }
            _ => {
                let other = self.sample_apis_from_seed();
                self.crossover(base, other, MUTATE_CHANGES)
            }
        }
    }

    /// Sample one seed weighted by quality and project its critical path to
    /// a deduplicated gadget-index list.
    fn sample_apis_from_seed(&mut self) -> Vec<usize> {
        let total: f64 = self.seeds.iter().map(|seed| seed.quality).sum();
        let index = if total > 0.0 {
            let mut point = self.rng.gen::<f64>() * total;
            let mut chosen = self.seeds.len() - 1;
            for (i, seed) in self.seeds.iter().enumerate() {
                point -= seed.quality;
                if point <= 0.0 {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            self.rng.gen_range(0..self.seeds.len())
        };

        let by_name: HashMap<&str, usize> = self
            .gadgets
            .iter()
            .enumerate()
            .map(|(i, gadget)| (gadget.name.as_str(), i))
            .collect();
        let mut names = HashSet::new();
        let mut projected = Vec::new();
        for (name, _) in &self.seeds[index].critical_path {
            let Some(&gadget) = by_name.get(name.as_str()) else {
                continue;
            };
            if names.insert(name.as_str()) {
                projected.push(gadget);
            }
        }
        projected
    }

    /// Insert up to `k` absent gadgets of highest energy at random offsets.
    fn insert(
        &mut self,
        mut list: Vec<usize>,
        energies: &[f64],
        maxlen: usize,
        mut k: usize,
    ) -> Vec<usize> {
        let mut have: HashSet<usize> = list.iter().copied().collect();
        let members: Vec<usize> = (0..self.gadgets.len()).collect();
        let mut candidates = Vec::new();
        for (_, mut bin) in self.group_energies(energies, &members) {
            bin.shuffle(&mut self.rng);
            candidates.extend(bin);
        }
        for candidate in candidates {
            if list.len() >= maxlen || k == 0 {
                break;
            }
            if !have.insert(candidate) {
                continue;
            }
            let offset = self.rng.gen_range(0..=list.len());
            list.insert(offset, candidate);
            k -= 1;
        }
        list
    }

    /// Drop the `k` members of lowest energy.
    fn remove(&mut self, list: Vec<usize>, energies: &[f64], k: usize) -> Vec<usize> {
        let grouped = self.group_energies(energies, &list);
        let lowest: HashSet<usize> = grouped
            .into_iter()
            .rev()
            .flat_map(|(_, bin)| bin)
            .take(k)
            .collect();
        list.into_iter()
            .filter(|index| !lowest.contains(index))
            .collect()
    }

    /// Splice a contiguous `k`-window of the shorter list into the longer.
    fn crossover(&mut self, a: Vec<usize>, b: Vec<usize>, k: usize) -> Vec<usize> {
        let (longer, shorter) = if a.len() >= b.len() { (a, b) } else { (b, a) };
        if longer.len() < k {
            let mut joined = longer;
            joined.extend(shorter);
            return joined;
        }
        if shorter.len() < k {
            if shorter.is_empty() {
                return longer;
            }
            let offset = self.rng.gen_range(0..=longer.len() - shorter.len());
            let mut spliced = longer[..offset].to_vec();
            spliced.extend(&shorter);
            spliced.extend(&longer[offset + shorter.len()..]);
            return spliced;
        }
        let i = self.rng.gen_range(0..=longer.len() - k);
        let j = self.rng.gen_range(0..=shorter.len() - k);
        let mut spliced = longer[..i].to_vec();
        spliced.extend(&shorter[j..j + k]);
        spliced.extend(&longer[i + k..]);
        spliced
    }
}
