//! Per-request emission state: persists raw records and publishes Transform
//! messages with their position flags.

use std::mem;

use tracing::{debug, trace};

use conduit_core::{
    CompletionToken, Envelope, ExtractionRequest, MessageFlags, PipelineMessage, RawRecordStore,
    SourceItem,
};

use super::StepError;
use crate::router::QueueRouter;

pub(crate) struct Emitter<'a> {
    raw: &'a dyn RawRecordStore,
    router: &'a QueueRouter,
    request: &'a ExtractionRequest,
    first_pending: bool,
    terminal_emitted: bool,
    emitted: usize,
}

impl<'a> Emitter<'a> {
    pub(crate) fn new(
        raw: &'a dyn RawRecordStore,
        router: &'a QueueRouter,
        request: &'a ExtractionRequest,
    ) -> Self {
        Self {
            raw,
            router,
            request,
            first_pending: request.first_pending,
            terminal_emitted: false,
            emitted: 0,
        }
    }

    /// Whether the step still waits for its first message.
    pub(crate) fn first_pending(&self) -> bool {
        self.first_pending
    }

    pub(crate) fn terminal_emitted(&self) -> bool {
        self.terminal_emitted
    }

    pub(crate) fn emitted(&self) -> usize {
        self.emitted
    }

    fn take_first(&mut self) -> bool {
        mem::replace(&mut self.first_pending, false)
    }

    fn flags_for(&mut self, token: &CompletionToken) -> MessageFlags {
        let last_item = token.is_exhausted();
        MessageFlags::new(
            self.take_first(),
            last_item,
            last_item && self.request.final_step,
        )
    }

    /// Store one item and publish its Transform message. `nested_type` names
    /// the sub-resource an item belongs to; the raw record is stored under it.
    pub(crate) async fn emit_item(
        &mut self,
        record_type: &str,
        nested_type: Option<&str>,
        item: &SourceItem,
        token: &CompletionToken,
    ) -> Result<(), StepError> {
        let stored_type = nested_type.unwrap_or(record_type);
        let raw_data_id = self
            .raw
            .put(self.request.job_id, stored_type, &item.key, item.payload.clone())
            .await
            .map_err(StepError::from_store)?;

        let flags = self.flags_for(token);
        let message = PipelineMessage {
            job_id: self.request.job_id,
            run_id: self.request.run_id,
            tenant_id: self.request.tenant_id,
            tier: self.request.tier,
            step: self.request.step.clone(),
            record_type: record_type.to_string(),
            raw_data_id: Some(raw_data_id),
            nested_type: nested_type.map(str::to_string),
            entity_ref: None,
            flags,
        };
        self.publish(message).await?;

        if flags.first_item || flags.last_item {
            debug!(
                subsystem = "jobs",
                component = "extraction",
                job_id = %self.request.job_id,
                step = %self.request.step,
                key = %item.key,
                first_item = flags.first_item,
                last_item = flags.last_item,
                last_job_item = flags.last_job_item,
                "Assigned position flags"
            );
        } else {
            trace!(
                subsystem = "jobs",
                component = "extraction",
                job_id = %self.request.job_id,
                key = %item.key,
                pending_scopes = ?token.pending_scopes(),
                "Emitted item"
            );
        }
        Ok(())
    }

    /// Flag-only terminal message for a step whose chain ended without
    /// assigning `last_item`.
    pub(crate) async fn emit_synthetic(&mut self, record_type: &str) -> Result<(), StepError> {
        let flags = MessageFlags::new(self.take_first(), true, self.request.final_step);
        let message = PipelineMessage::synthetic(self.request, record_type, flags);
        self.publish(message).await?;
        debug!(
            subsystem = "jobs",
            component = "extraction",
            job_id = %self.request.job_id,
            step = %self.request.step,
            first_item = flags.first_item,
            last_job_item = flags.last_job_item,
            "Emitted synthetic completion message"
        );
        Ok(())
    }

    async fn publish(&mut self, message: PipelineMessage) -> Result<(), StepError> {
        let terminal = message.flags.last_item;
        self.router
            .publish(self.request.tier, Envelope::Transform(message))
            .await
            .map_err(StepError::from_store)?;
        self.emitted += 1;
        self.terminal_emitted |= terminal;
        Ok(())
    }
}
