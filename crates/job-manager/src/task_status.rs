use creel_worker::JobId;
use tokio::sync::oneshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusUpdateData {
    /// A job was handed to the executor.
    Dispatched { units: usize, merge: bool },
    /// A job finished with a non-zero return code.
    Failed { return_code: i32 },
    Succeeded,
    /// A job left running by an earlier run was found at startup.
    Recovered { successful: bool },
}

#[derive(Debug, Clone)]
pub struct StatusUpdateItem {
    pub job: JobId,
    pub workflow: String,
    pub timestamp: time::OffsetDateTime,
    pub data: StatusUpdateData,
}

pub enum StatusUpdateOp {
    Item(StatusUpdateItem),
    ReadFrom((tokio::sync::oneshot::Sender<Vec<StatusUpdateItem>>, usize)),
    Take(tokio::sync::oneshot::Sender<Vec<StatusUpdateItem>>),
}

/// A log of what happened to every job, kept in memory for whoever is presenting progress.
#[derive(Clone)]
pub struct StatusCollector {
    tx: flume::Sender<StatusUpdateOp>,
}

impl StatusCollector {
    pub fn new(estimated_num_jobs: usize) -> Self {
        let (tx, rx) = flume::unbounded();
        let collector = StatusCollector { tx };

        tokio::task::spawn(async move {
            let mut next_vec_size = estimated_num_jobs * 5 / 2;
            let mut items = Vec::with_capacity(next_vec_size);
            while let Ok(op) = rx.recv_async().await {
                match op {
                    StatusUpdateOp::Item(item) => {
                        items.push(item);
                    }
                    StatusUpdateOp::ReadFrom((tx, start)) => {
                        let start = start.min(items.len());
                        tx.send(items[start..].to_vec()).ok();
                    }
                    StatusUpdateOp::Take(tx) => {
                        next_vec_size = std::cmp::max(16, next_vec_size.saturating_sub(items.len()));
                        let items =
                            std::mem::replace(&mut items, Vec::with_capacity(next_vec_size));
                        tx.send(items).ok();
                    }
                }
            }
        });

        collector
    }

    pub fn add(&self, job: JobId, workflow: &str, data: StatusUpdateData) {
        self.tx
            .send(StatusUpdateOp::Item(StatusUpdateItem {
                job,
                workflow: workflow.to_string(),
                timestamp: time::OffsetDateTime::now_utc(),
                data,
            }))
            .ok();
    }

    pub async fn read(&self) -> Vec<StatusUpdateItem> {
        self.read_from(0).await
    }

    pub async fn read_from(&self, start: usize) -> Vec<StatusUpdateItem> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(StatusUpdateOp::ReadFrom((tx, start))).ok();
        rx.await.unwrap_or_default()
    }

    pub async fn take(&self) -> Vec<StatusUpdateItem> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(StatusUpdateOp::Take(tx)).ok();
        rx.await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn collects_updates_in_order() {
        let status = StatusCollector::new(4);
        status.add(JobId(1), "ttbar", StatusUpdateData::Dispatched { units: 3, merge: false });
        status.add(JobId(1), "ttbar", StatusUpdateData::Failed { return_code: 8001 });
        status.add(JobId(2), "ttbar", StatusUpdateData::Succeeded);

        let items = status.read_from(1).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].data, StatusUpdateData::Failed { return_code: 8001 });
        assert_eq!(items[1].job, JobId(2));

        assert_eq!(status.take().await.len(), 3);
        assert!(status.read().await.is_empty());
    }
}
