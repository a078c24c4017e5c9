//! Two-stage pipeline orchestrator.
//!
//! Composes the retrieval stage and an answer generator into a fixed
//! retrieve → generate sequence, exposed as a blocking [`Pipeline::run`]
//! and a streaming [`Pipeline::run_streaming`] that re-shapes generation
//! updates into caller-facing progress events.

use crate::error::Result;
use crate::stages::{AnswerGenerator, RetrievalStage};
use crate::state::{GenerationUpdate, PipelineEvent, PipelinePhase, PipelineState};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

/// Sequential retrieve → generate pipeline.
///
/// Holds no per-run state; one instance can serve concurrent `run` and
/// `run_streaming` calls as long as the underlying collaborators allow it.
pub struct Pipeline {
    retrieval: Arc<RetrievalStage>,
    generator: Arc<dyn AnswerGenerator>,
}

impl Pipeline {
    pub fn new(retrieval: RetrievalStage, generator: Arc<dyn AnswerGenerator>) -> Self {
        Self {
            retrieval: Arc::new(retrieval),
            generator,
        }
    }

    /// Run both stages in strict sequence and return the final state.
    ///
    /// Fatal on the first collaborator error; no partial results.
    pub async fn run(&self, question: &str) -> Result<PipelineState> {
        let state = PipelineState::new(question);
        let state = self.retrieval.retrieve(&state).await?;
        info!(docs = state.retrieved_docs.len(), "Retrieval complete");
        let state = self.generator.generate(&state).await?;
        debug!("Generation complete");
        Ok(state)
    }

    /// Stream progress events for one pipeline run.
    ///
    /// The sequence is fixed: a retrieving banner without state, a
    /// retrieving event carrying the post-retrieval state, a generating
    /// event with empty content, zero or more generating events carrying
    /// the cumulative answer (state stays pinned to the post-retrieval
    /// snapshot), then exactly one complete event if generation produced
    /// a final state. A retrieval failure yields one `Err` item and ends
    /// the sequence. The stream is finite and not restartable; dropping
    /// it is the only cancellation signal.
    pub fn run_streaming(&self, question: &str) -> ReceiverStream<Result<PipelineEvent>> {
        let (tx, rx) = mpsc::channel(32);
        let retrieval = Arc::clone(&self.retrieval);
        let generator = Arc::clone(&self.generator);
        let question = question.to_string();

        tokio::spawn(async move {
            let _ = tx
                .send(Ok(PipelineEvent::new(
                    PipelinePhase::Retrieving,
                    "Retrieving relevant documents...",
                    None,
                )))
                .await;

            let initial = PipelineState::new(question);
            let state = match retrieval.retrieve(&initial).await {
                Ok(state) => state,
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let _ = tx
                .send(Ok(PipelineEvent::new(
                    PipelinePhase::Retrieving,
                    format!("Found {} relevant documents", state.retrieved_docs.len()),
                    Some(state.clone()),
                )))
                .await;

            let _ = tx
                .send(Ok(PipelineEvent::new(
                    PipelinePhase::Generating,
                    "",
                    Some(state.clone()),
                )))
                .await;

            let (gtx, mut grx) = mpsc::channel(32);
            let gen_state = state.clone();
            let generation = tokio::spawn(async move {
                generator.generate_streaming(&gen_state, gtx).await;
            });

            let mut final_state: Option<PipelineState> = None;
            while let Some(update) = grx.recv().await {
                match update {
                    GenerationUpdate::Fragment(text) => {
                        let _ = tx
                            .send(Ok(PipelineEvent::new(
                                PipelinePhase::Generating,
                                text,
                                Some(state.clone()),
                            )))
                            .await;
                    }
                    GenerationUpdate::Final(s) => final_state = Some(s),
                }
            }
            let _ = generation.await;

            // A generator that never finalized is tolerated: the sequence
            // simply ends after the last generating event.
            if let Some(final_state) = final_state {
                let answer = final_state.answer.clone().unwrap_or_default();
                let _ = tx
                    .send(Ok(PipelineEvent::new(
                        PipelinePhase::Complete,
                        answer,
                        Some(final_state),
                    )))
                    .await;
            }
        });

        ReceiverStream::new(rx)
    }
}
