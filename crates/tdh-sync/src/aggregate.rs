//! Folding per-record outcomes into one batch result.

use tdh_core::{UpdateDetail, UpdateResult};

const SEPARATOR: &str = ",";

#[derive(Debug, Clone, Default)]
pub struct ResultAggregator {
    batch_id: Option<String>,
    source: String,
    operation: String,
    updatetype: String,
    otherinfo: String,
    batch_errors: Vec<String>,
    details: Vec<UpdateDetail>,
}

impl ResultAggregator {
    pub fn new(source: impl Into<String>, operation: impl Into<String>, updatetype: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            operation: operation.into(),
            updatetype: updatetype.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_id(mut self, id: impl Into<String>) -> Self {
        self.batch_id = Some(id.into());
        self
    }

    pub fn with_otherinfo(mut self, otherinfo: impl Into<String>) -> Self {
        self.otherinfo = otherinfo.into();
        self
    }

    pub fn push(&mut self, detail: UpdateDetail) {
        self.details.push(detail);
    }

    pub fn extend(&mut self, details: impl IntoIterator<Item = UpdateDetail>) {
        self.details.extend(details);
    }

    /// A failure that aborted the whole batch.
    pub fn batch_error(&mut self, message: impl Into<String>) {
        self.batch_errors.push(message.into());
    }

    pub fn details(&self) -> &[UpdateDetail] {
        &self.details
    }

    pub fn finish(&self) -> UpdateResult {
        let mut result = UpdateResult {
            id: self.batch_id.clone().unwrap_or_else(|| {
                self.details
                    .iter()
                    .map(|d| d.id.as_str())
                    .collect::<Vec<_>>()
                    .join(SEPARATOR)
            }),
            source: self.source.clone(),
            operation: self.operation.clone(),
            updatetype: self.updatetype.clone(),
            otherinfo: self.otherinfo.clone(),
            error: self.batch_errors.len() as u32,
            ..Default::default()
        };

        let mut exceptions = self.batch_errors.clone();
        for detail in &self.details {
            result.created += detail.created;
            result.updated += detail.updated;
            result.deleted += detail.deleted;
            result.error += detail.error;
            result.objectcompared += detail.objectcompared;
            result.objectchanged += detail.objectchanged;
            result.objectimagechanged += detail.objectimagechanged;
            if let Some(changes) = &detail.changes {
                result.objectchanges.push(changes.clone());
            }
            result.pushchannels.extend(detail.pushchannels.iter().cloned());
            for (channel, response) in &detail.pushed {
                result
                    .pushed
                    .entry(channel.clone())
                    .or_default()
                    .push(response.clone());
            }
            if let Some(exception) = detail.exception.as_deref().filter(|e| !e.is_empty()) {
                exceptions.push(exception.to_string());
            }
        }

        result.recordsmodified = result.created + result.updated + result.deleted;
        result.exception = exceptions.join(SEPARATOR);
        result.success = result.error == 0 && result.exception.is_empty();
        result.message = format!(
            "{} {}: {} created, {} updated, {} deleted, {} errors",
            self.source,
            if result.success { "succeeded" } else { "failed" },
            result.created,
            result.updated,
            result.deleted,
            result.error
        );
        result
    }

    /// Convenience for callers holding a finished list of details.
    pub fn aggregate(details: impl IntoIterator<Item = UpdateDetail>) -> UpdateResult {
        let mut aggregator = Self::default();
        aggregator.extend(details);
        aggregator.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tdh_core::NotifierResponse;

    fn detail(id: &str) -> UpdateDetail {
        UpdateDetail::for_record(id, "odhactivitypoi", "import")
    }

    #[test]
    fn sums_counts_and_derives_records_modified() {
        let created = UpdateDetail { created: 1, ..detail("A") };
        let updated = UpdateDetail { updated: 1, ..detail("B") };
        let failed = UpdateDetail::failed("C", "odhactivitypoi", "import", "store down");

        let result = ResultAggregator::aggregate([created, updated, failed]);
        assert_eq!((result.created, result.updated, result.error), (1, 1, 1));
        assert_eq!(result.recordsmodified, 2);
        assert_eq!(result.id, "A,B,C");
        assert_eq!(result.exception, "store down");
        assert!(!result.success);
    }

    #[test]
    fn groups_pushed_responses_by_channel() {
        let mut a = detail("A");
        a.pushchannels.insert("marketplace".into());
        a.pushed
            .insert("marketplace".into(), NotifierResponse::delivered("marketplace", 200, None));
        let mut b = detail("B");
        b.pushchannels.insert("marketplace".into());
        b.pushchannels.insert("website".into());
        b.pushed
            .insert("marketplace".into(), NotifierResponse::failed("marketplace", 500, "boom"));

        let result = ResultAggregator::aggregate([a, b]);
        assert_eq!(result.pushchannels.len(), 2);
        assert_eq!(result.pushed["marketplace"].len(), 2);
        assert!(result.success);
    }

    #[test]
    fn batch_errors_lead_the_exception_list() {
        let mut aggregator = ResultAggregator::new("lts", "import", "batch").with_batch_id("run-1");
        aggregator.batch_error("catalogue unreachable");
        aggregator.push(UpdateDetail::failed("X", "poi", "import", "bad record"));
        let result = aggregator.finish();
        assert_eq!(result.id, "run-1");
        assert_eq!(result.error, 2);
        assert_eq!(result.exception, "catalogue unreachable,bad record");
        assert!(!result.success);
    }
}
