use std::sync::Arc;

use super::RegisterService;
use crate::error::StreamError;
use crate::ingest::{SegmentObject, SpanObject};
use crate::storage::Storage;

/// Replaces the names carried by segments and spans with registered ids.
///
/// Ids already filled in are left alone, so a segment that failed halfway
/// only repeats the missing lookups on retry. A resolved name is cleared from
/// the span.
pub struct SpanExchanger<S: Storage> {
    register: Arc<RegisterService<S>>,
}

impl<S: Storage> SpanExchanger<S> {
    pub fn new(register: Arc<RegisterService<S>>) -> Self {
        Self { register }
    }

    pub async fn exchange_segment(&self, segment: &mut SegmentObject) -> Result<(), StreamError> {
        if segment.application_id == 0 {
            segment.application_id = self.register.application_id(&segment.application_code).await?;
        }

        if segment.instance_id == 0 {
            segment.instance_id = self
                .register
                .instance_id(segment.application_id, &segment.instance_uuid)
                .await?;
        }

        let application_id = segment.application_id;
        for span in &mut segment.spans {
            self.exchange_span(span, application_id).await?;
        }

        Ok(())
    }

    pub async fn exchange_span(
        &self,
        span: &mut SpanObject,
        application_id: i32,
    ) -> Result<(), StreamError> {
        if span.peer_id == 0 && !span.peer.is_empty() {
            span.peer_id = self.register.address_id(&span.peer).await?;
            span.peer.clear();
        }

        if span.operation_id == 0 && !span.operation_name.is_empty() {
            span.operation_id = self
                .register
                .service_id(application_id, &span.operation_name)
                .await?;
            span.operation_name.clear();
        }

        Ok(())
    }
}
