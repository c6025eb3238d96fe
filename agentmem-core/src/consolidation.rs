//! Background consolidation: promotes recurring episodic outcomes into
//! semantic patterns and decays stale ones.
//!
//! Runs are single-flight: a run that starts while another is active aborts
//! immediately. Work is batched so no write lock is held across the whole
//! pass.

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::{Clock as _, SharedClock};
use crate::config::MemoryConfig;
use crate::error::Result;
use crate::record::{Episode, EpisodeUpdate, PatternFilter, PatternKind, SemanticPattern};
use crate::retrieval::text_similarity;
use crate::store::{EpisodicStore, SemanticStore};

/// What one consolidation run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsolidationOutcome {
    /// True when the run aborted because another run was active
    pub skipped: bool,
    /// Episodes examined
    pub examined: usize,
    /// Clusters meeting the size threshold
    pub clusters: usize,
    /// New semantic patterns created
    pub patterns_created: usize,
    /// Existing patterns reinforced
    pub patterns_reinforced: usize,
    /// Episodes marked consolidated
    pub episodes_marked: usize,
    /// Patterns decayed in the staleness pass
    pub patterns_decayed: usize,
}

/// Periodic episodic-to-semantic promotion worker.
pub struct Consolidator {
    episodic: Arc<EpisodicStore>,
    semantic: Arc<SemanticStore>,
    clock: SharedClock,
    config: MemoryConfig,
    in_flight: tokio::sync::Mutex<()>,
}

impl Consolidator {
    /// Create a consolidator over the two stores.
    #[must_use]
    pub fn new(
        episodic: Arc<EpisodicStore>,
        semantic: Arc<SemanticStore>,
        clock: SharedClock,
        config: MemoryConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            episodic,
            semantic,
            clock,
            config,
            in_flight: tokio::sync::Mutex::new(()),
        })
    }

    /// Run one consolidation pass; aborts immediately if one is in flight.
    pub async fn run_once(&self) -> Result<ConsolidationOutcome> {
        let Ok(_flight) = self.in_flight.try_lock() else {
            debug!("consolidation already running, skipping");
            return Ok(ConsolidationOutcome {
                skipped: true,
                ..ConsolidationOutcome::default()
            });
        };

        let mut outcome = ConsolidationOutcome::default();

        let episodes = self
            .episodic
            .sample_unconsolidated(self.config.consolidation.batch_size)
            .await?;
        outcome.examined = episodes.len();

        let clusters = self.cluster(&episodes);
        for cluster in clusters {
            if cluster.len() < self.config.consolidation.min_cluster_size {
                continue;
            }
            outcome.clusters += 1;
            self.promote_cluster(&cluster, &mut outcome).await?;
        }

        outcome.patterns_decayed = self.semantic.decay_stale().await?;

        info!(
            examined = outcome.examined,
            clusters = outcome.clusters,
            created = outcome.patterns_created,
            reinforced = outcome.patterns_reinforced,
            decayed = outcome.patterns_decayed,
            "consolidation pass complete"
        );
        Ok(outcome)
    }

    // Groups episodes by identical tag set, then within each group by
    // near-duplicate outcome text.
    fn cluster<'a>(&self, episodes: &'a [Episode]) -> Vec<Vec<&'a Episode>> {
        let threshold = self.config.consolidation.duplicate_threshold;
        let mut groups: Vec<(BTreeSet<String>, Vec<Vec<&'a Episode>>)> = Vec::new();

        for episode in episodes {
            let group_index = match groups.iter().position(|(tags, _)| *tags == episode.tags) {
                Some(index) => index,
                None => {
                    groups.push((episode.tags.clone(), Vec::new()));
                    groups.len() - 1
                }
            };
            let clusters = &mut groups[group_index].1;
            let matching = clusters.iter_mut().find(|cluster| {
                cluster
                    .first()
                    .is_some_and(|rep| text_similarity(&rep.outcome, &episode.outcome) >= threshold)
            });
            match matching {
                Some(cluster) => cluster.push(episode),
                None => clusters.push(vec![episode]),
            }
        }

        groups
            .into_iter()
            .flat_map(|(_, clusters)| clusters)
            .collect()
    }

    async fn promote_cluster(
        &self,
        cluster: &[&Episode],
        outcome: &mut ConsolidationOutcome,
    ) -> Result<()> {
        let representative = cluster[0];
        let tags: Vec<&str> = representative.tags.iter().map(String::as_str).collect();
        let content = if tags.is_empty() {
            representative.outcome.clone()
        } else {
            format!("[{}] {}", tags.join(","), representative.outcome)
        };
        let episode_ids: BTreeSet<Uuid> = cluster.iter().map(|e| e.memory_id).collect();

        let existing = self.find_matching_pattern(&content).await?;
        match existing {
            Some(pattern) => {
                let fresh: Vec<Uuid> = episode_ids
                    .iter()
                    .filter(|id| !pattern.derived_from.contains(id))
                    .copied()
                    .collect();
                if fresh.is_empty() {
                    debug!(pattern_id = %pattern.memory_id, "cluster already consolidated");
                } else {
                    let delta = u32::try_from(fresh.len()).unwrap_or(u32::MAX);
                    self.semantic
                        .reinforce(pattern.memory_id, delta, &fresh)
                        .await?;
                    outcome.patterns_reinforced += 1;
                }
            }
            None => {
                let pattern = SemanticPattern::new(
                    PatternKind::Procedure,
                    content,
                    episode_ids.clone(),
                    self.config.confidence_alpha,
                    self.clock.now(),
                );
                self.semantic.add(pattern).await?;
                outcome.patterns_created += 1;
            }
        }

        for episode in cluster {
            let update = EpisodeUpdate {
                consolidated: Some(true),
                derived_pattern_count: Some(episode.derived_pattern_count + 1),
                ..EpisodeUpdate::default()
            };
            match self.episodic.update(episode.memory_id, &update).await {
                Ok(_) => outcome.episodes_marked += 1,
                Err(e) => {
                    warn!(memory_id = %episode.memory_id, error = %e, "failed to mark episode consolidated");
                }
            }
        }
        Ok(())
    }

    async fn find_matching_pattern(&self, content: &str) -> Result<Option<SemanticPattern>> {
        let threshold = self.config.consolidation.duplicate_threshold;
        let candidates = self
            .semantic
            .query(
                &PatternFilter {
                    kind: Some(PatternKind::Procedure),
                    ..PatternFilter::default()
                },
                self.config.max_query_limit,
            )
            .await?;
        Ok(candidates
            .into_iter()
            .find(|pattern| text_similarity(&pattern.content, content) >= threshold))
    }

    /// Spawn the periodic worker; abort the handle to stop it.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let consolidator = self;
        let interval = consolidator.config.consolidation.interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick fires immediately; skip it so startup stays quiet.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = consolidator.run_once().await {
                    warn!(error = %e, "consolidation pass failed");
                }
            }
        })
    }
}
