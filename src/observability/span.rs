//! Correlated logging context, modeled on `enterprise::tracing::correlation`.
//!
//! A [`CorrelatedSpan`] carries the fields every structured log line in the
//! kernel should include, and opens a `tracing` span pre-populated with them
//! so nested `tracing::info!`/`warn!` calls inherit the context for free.

/// The correlation fields carried through the kernel's structured logs.
#[derive(Debug, Clone, Default)]
pub struct CorrelatedSpan {
    /// The document a log line concerns.
    pub doc_id: Option<String>,
    /// The client a log line concerns.
    pub client_id: Option<String>,
    /// The session a log line concerns.
    pub session_id: Option<String>,
    /// An operation id, for correlating a request across async boundaries.
    pub op_id: Option<String>,
    /// The frontier tag in effect when the log line was emitted.
    pub frontier_tag: Option<String>,
    /// The parent span id, when this context nests under another.
    pub parent_span_id: Option<String>,
}

impl CorrelatedSpan {
    /// Start building a span for a document.
    pub fn for_doc(doc_id: impl Into<String>) -> Self {
        Self {
            doc_id: Some(doc_id.into()),
            ..Default::default()
        }
    }

    /// Attach a client id.
    pub fn with_client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Attach a session id.
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Attach an operation id.
    pub fn with_op(mut self, op_id: impl Into<String>) -> Self {
        self.op_id = Some(op_id.into());
        self
    }

    /// Attach a frontier tag.
    pub fn with_frontier_tag(mut self, frontier_tag: impl Into<String>) -> Self {
        self.frontier_tag = Some(frontier_tag.into());
        self
    }

    /// Attach a parent span id.
    pub fn with_parent(mut self, parent_span_id: impl Into<String>) -> Self {
        self.parent_span_id = Some(parent_span_id.into());
        self
    }

    /// Open a `tracing` span carrying every populated correlation field.
    /// Fields left unset are recorded as the empty string rather than
    /// omitted, so log aggregation queries can rely on a stable field set.
    pub fn enter(&self) -> tracing::span::EnteredSpan {
        tracing::info_span!(
            "sync_operation",
            doc_id = self.doc_id.as_deref().unwrap_or(""),
            client_id = self.client_id.as_deref().unwrap_or(""),
            session_id = self.session_id.as_deref().unwrap_or(""),
            op_id = self.op_id.as_deref().unwrap_or(""),
            frontier_tag = self.frontier_tag.as_deref().unwrap_or(""),
            parent_span_id = self.parent_span_id.as_deref().unwrap_or(""),
        )
        .entered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_populates_every_field() {
        let span = CorrelatedSpan::for_doc("doc-1")
            .with_client("client-1")
            .with_session("sess-1")
            .with_op("op-1")
            .with_frontier_tag("t1")
            .with_parent("span-0");

        assert_eq!(span.doc_id.as_deref(), Some("doc-1"));
        assert_eq!(span.client_id.as_deref(), Some("client-1"));
        assert_eq!(span.session_id.as_deref(), Some("sess-1"));
        assert_eq!(span.op_id.as_deref(), Some("op-1"));
        assert_eq!(span.frontier_tag.as_deref(), Some("t1"));
        assert_eq!(span.parent_span_id.as_deref(), Some("span-0"));
    }

    #[test]
    fn enter_does_not_panic_with_partial_fields() {
        let span = CorrelatedSpan::for_doc("doc-1");
        let _guard = span.enter();
    }
}
