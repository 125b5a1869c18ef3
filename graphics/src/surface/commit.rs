//! Commitment protocol.
//!
//! Committing a surface walks the graph of surfaces it sampled this frame and
//! appends an (upload, render) [`Submission`] for every generation that has
//! not been committed yet. Dependencies are appended before their dependents,
//! so submitting the collector in order satisfies every semaphore wait.
//!
//! Every commit registers a request on each generation it reaches. A
//! generation that already has a request (or is already sampleable) is not
//! appended again, which keeps shared dependencies to a single submission per
//! frame. [`RenderSurface::abort_render`] withdraws the requests of a commit
//! whose submission never reached the queue.
//!
//! The walk uses an explicit stack and holds at most one slot lock at a time.

use std::collections::HashSet;
use std::sync::Arc;

use crate::error::GraphicsError;
use crate::scheduler::SubmitInfo;

use super::RenderSurface;
use super::dependency::{DependencyInfo, DependencyReference};

/// The work of one surface generation for one frame.
#[derive(Debug, Clone)]
pub struct Submission {
    pub surface_id: u64,
    pub slot: usize,
    pub label: String,
    /// Writes the per-frame uniform data and signals the handoff.
    pub upload: SubmitInfo,
    /// Draws and finalizes after the handoff and every dependency completed.
    pub render: SubmitInfo,
}

/// Ordered output of a commit: dependencies before dependents.
#[derive(Debug, Default)]
pub struct SubmissionCollector {
    entries: Vec<Submission>,
}

impl SubmissionCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of collected submissions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing was collected.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collected submissions in submission order.
    pub fn entries(&self) -> &[Submission] {
        &self.entries
    }

    /// Labels of the collected surfaces in submission order.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|s| s.label.as_str())
    }

    /// Position of a surface's submission, if it was collected.
    pub fn position(&self, surface_id: u64) -> Option<usize> {
        self.entries.iter().position(|s| s.surface_id == surface_id)
    }

    /// Flatten into queue submissions: upload then render, per surface, in order.
    pub fn submit_infos(&self) -> Vec<SubmitInfo> {
        self.entries
            .iter()
            .flat_map(|s| [s.upload.clone(), s.render.clone()])
            .collect()
    }

    fn push(&mut self, submission: Submission) {
        self.entries.push(submission);
    }

    fn truncate(&mut self, len: usize) {
        self.entries.truncate(len);
    }
}

/// A resolved generation during a graph walk.
#[derive(Clone)]
struct Node {
    surface: Arc<RenderSurface>,
    slot: usize,
}

impl Node {
    fn new(surface: &Arc<RenderSurface>, slot: usize) -> Self {
        Self {
            surface: Arc::clone(surface),
            slot,
        }
    }

    fn resolve(reference: &DependencyReference) -> Result<Self, GraphicsError> {
        Ok(Self {
            surface: reference.resolve()?,
            slot: reference.info.slot,
        })
    }

    fn key(&self) -> (u64, usize) {
        (self.surface.id(), self.slot)
    }
}

/// Live generations behind `references`; dropped surfaces have nothing to update.
fn live_nodes(references: &[DependencyReference]) -> impl Iterator<Item = Node> + '_ {
    references.iter().filter_map(|r| Node::resolve(r).ok())
}

enum Step {
    Enter(DependencyReference),
    Exit(Node),
}

impl RenderSurface {
    /// Commit the generation `info` of this surface and everything it samples.
    ///
    /// Appends the submissions that are not yet committed this frame to
    /// `collector`. On failure nothing is appended and every request the
    /// walk registered is withdrawn.
    ///
    /// # Errors
    ///
    /// - [`GraphicsError::InvalidState`] if a reached generation is still
    ///   recording, was never recorded and is not sampleable, or belongs to a
    ///   surface that was dropped.
    /// - [`GraphicsError::DependencyCycle`] if a surface depends on itself
    ///   through other surfaces.
    pub fn commit_render(
        self: &Arc<Self>,
        info: DependencyInfo,
        collector: &mut SubmissionCollector,
    ) -> Result<(), GraphicsError> {
        crate::profile_scope!("commit_render");
        let start = collector.len();
        let mut requested: Vec<Node> = Vec::new();

        let result = walk_commit(
            DependencyReference::new(self, info.slot),
            collector,
            &mut requested,
        );

        if let Err(e) = &result {
            log::trace!(
                "commit of '{}'[{}] failed, withdrawing {} requests: {e}",
                self.label(),
                info.slot,
                requested.len()
            );
            for node in &requested {
                let mut slot = node.surface.slot(node.slot);
                slot.request_count = slot.request_count.saturating_sub(1);
            }
            collector.truncate(start);
        } else {
            log::trace!(
                "committed '{}'[{}]: {} new submissions",
                self.label(),
                info.slot,
                collector.len() - start
            );
        }
        result
    }

    /// Withdraw the requests a successful commit registered.
    ///
    /// Use when the collected submissions never reached the queue. Each
    /// generation whose last request is withdrawn is marked unsubmitted and
    /// releases its own dependencies in turn.
    pub fn abort_render(self: &Arc<Self>, info: DependencyInfo) {
        let mut stack = vec![Node::new(self, info.slot)];
        while let Some(node) = stack.pop() {
            let mut slot = node.surface.slot(node.slot);
            if slot.request_count == 0 {
                continue;
            }
            slot.request_count -= 1;
            if slot.request_count == 0 && !slot.ready {
                slot.has_been_submitted = false;
                stack.extend(live_nodes(&slot.dependencies));
            }
        }
        log::trace!("aborted '{}'[{}]", self.label(), info.slot);
    }

    /// Mark the committed generations as enqueued.
    pub fn confirm_submission(self: &Arc<Self>, info: DependencyInfo) {
        let mut visited = HashSet::new();
        let mut stack = vec![Node::new(self, info.slot)];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.key()) {
                continue;
            }
            let mut slot = node.surface.slot(node.slot);
            if slot.ready || slot.is_recording() {
                continue;
            }
            slot.has_been_submitted = true;
            stack.extend(live_nodes(&slot.dependencies));
        }
    }

    /// Mark every committed generation whose completion was signaled as ready.
    ///
    /// Descends through generations that are already ready, since a readiness
    /// query on the root does not reach its dependencies. A failed completion
    /// query is reported and poisons the surface it belongs to.
    pub fn confirm_finished(self: &Arc<Self>, info: DependencyInfo) {
        let backend = self.instance.backend();
        let mut visited = HashSet::new();
        let mut stack = vec![Node::new(self, info.slot)];
        while let Some(node) = stack.pop() {
            if !visited.insert(node.key()) {
                continue;
            }
            let mut slot = node.surface.slot(node.slot);
            if slot.is_recording() {
                continue;
            }
            let mut failure = None;
            if !slot.ready && slot.recorded {
                match backend.semaphore_value(&slot.completion) {
                    Ok(value) if value >= slot.target => {
                        slot.ready = true;
                        slot.has_been_submitted = false;
                    }
                    Ok(_) => {}
                    Err(e) => failure = Some(e),
                }
            }
            stack.extend(live_nodes(&slot.dependencies));
            drop(slot);

            if let Some(e) = failure {
                node.surface.fail(e, "confirm_finished");
            }
        }
    }
}

/// Depth-first walk: a node's submission is appended on exit, after all of its
/// dependencies. Every registered request is logged in `requested`.
fn walk_commit(
    root: DependencyReference,
    collector: &mut SubmissionCollector,
    requested: &mut Vec<Node>,
) -> Result<(), GraphicsError> {
    let mut visiting: HashSet<(u64, usize)> = HashSet::new();
    let mut stack = vec![Step::Enter(root)];

    while let Some(step) = stack.pop() {
        match step {
            Step::Enter(reference) => {
                let node = Node::resolve(&reference)?;
                if visiting.contains(&node.key()) {
                    return Err(GraphicsError::DependencyCycle {
                        surface: node.surface.label().to_string(),
                    });
                }

                let mut slot = node.surface.slot(node.slot);
                if slot.ready || slot.request_count > 0 {
                    slot.request_count += 1;
                    drop(slot);
                    requested.push(node);
                    continue;
                }
                if slot.is_recording() {
                    return Err(GraphicsError::InvalidState(format!(
                        "'{}'[{}] is still recording",
                        node.surface.label(),
                        node.slot
                    )));
                }
                if !slot.recorded {
                    return Err(GraphicsError::InvalidState(format!(
                        "'{}'[{}] has nothing recorded",
                        node.surface.label(),
                        node.slot
                    )));
                }
                let dependencies = slot.dependencies.clone();
                drop(slot);

                visiting.insert(node.key());
                stack.push(Step::Exit(node));
                stack.extend(dependencies.into_iter().rev().map(Step::Enter));
            }
            Step::Exit(node) => {
                visiting.remove(&node.key());

                let dependencies = node.surface.slot(node.slot).dependencies.clone();
                let waits = dependencies
                    .iter()
                    .map(|d| {
                        let dependency = Node::resolve(d)?;
                        let wait = dependency.surface.slot(dependency.slot).completion_wait();
                        Ok(wait)
                    })
                    .collect::<Result<Vec<_>, GraphicsError>>()?;

                let mut slot = node.surface.slot(node.slot);
                slot.render_waits.truncate(1);
                slot.render_waits.extend(waits);
                collector.push(slot.submission(node.surface.id(), node.surface.label()));
                slot.request_count += 1;
                drop(slot);

                log::trace!(
                    "collected '{}'[{}] with {} dependency waits",
                    node.surface.label(),
                    node.slot,
                    dependencies.len()
                );
                requested.push(node);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_collector() {
        let collector = SubmissionCollector::new();
        assert!(collector.is_empty());
        assert!(collector.submit_infos().is_empty());
        assert_eq!(collector.position(1), None);
    }
}
