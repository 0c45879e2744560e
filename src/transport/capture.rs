//! Bounded buffer of captured requests.

use std::collections::VecDeque;

use crate::models::RequestDescriptor;

use super::RequestFilter;

/// Ring buffer of the most recent requests observed on the session.
///
/// Owned by the transport; the oldest entry is evicted once `capacity`
/// is reached.
#[derive(Debug, Clone)]
pub struct CaptureBuffer {
    entries: VecDeque<RequestDescriptor>,
    capacity: usize,
}

impl CaptureBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, request: RequestDescriptor) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(request);
    }

    /// Newest entry matching `filter`.
    pub fn latest_matching(&self, filter: &RequestFilter) -> Option<&RequestDescriptor> {
        self.entries.iter().rev().find(|r| filter.matches(r))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DOC_ID_PARAM;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn request(doc: &str, url: &str) -> RequestDescriptor {
        RequestDescriptor {
            url: url.into(),
            method: "POST".into(),
            form: BTreeMap::from([(DOC_ID_PARAM.to_string(), doc.to_string())]),
            captured_at: Utc::now(),
        }
    }

    #[test]
    fn test_evicts_oldest() {
        let mut buffer = CaptureBuffer::new(2);
        buffer.push(request("1", "a"));
        buffer.push(request("2", "b"));
        buffer.push(request("3", "c"));
        assert_eq!(buffer.len(), 2);

        let filter = RequestFilter {
            doc_id: Some("1".into()),
            ..RequestFilter::default()
        };
        assert!(buffer.latest_matching(&filter).is_none());
    }

    #[test]
    fn test_latest_matching_prefers_newest() {
        let mut buffer = CaptureBuffer::new(8);
        buffer.push(request("1", "old"));
        buffer.push(request("2", "other"));
        buffer.push(request("1", "new"));

        let filter = RequestFilter {
            doc_id: Some("1".into()),
            ..RequestFilter::default()
        };
        assert_eq!(buffer.latest_matching(&filter).unwrap().url, "new");
    }
}
