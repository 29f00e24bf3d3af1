use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use tracing::{debug, error};

use crate::buffer::{zeroed_page, PageBuf};
use crate::common::{BirchError, PageId, Result};

use super::DiskManager;

/// Depth of the request queue between callers and the worker
const REQUEST_QUEUE_DEPTH: usize = 128;

/// A disk I/O request. Each request owns its buffer and carries the channel
/// its completion is reported on.
pub enum DiskRequest {
    Read {
        page_id: PageId,
        reply: Sender<Result<PageBuf>>,
    },
    Write {
        page_id: PageId,
        data: PageBuf,
        reply: Sender<Result<()>>,
    },
}

/// DiskScheduler runs page I/O on a background worker thread fed through a
/// bounded channel. Dropping the scheduler closes the channel; the worker
/// drains queued requests and exits, and the drop waits for it.
pub struct DiskScheduler {
    disk_manager: Arc<DiskManager>,
    request_sender: Option<Sender<DiskRequest>>,
    worker_handle: Option<JoinHandle<()>>,
}

impl DiskScheduler {
    pub fn new(disk_manager: Arc<DiskManager>) -> Self {
        let (sender, receiver) = bounded::<DiskRequest>(REQUEST_QUEUE_DEPTH);

        let dm_clone = Arc::clone(&disk_manager);
        let worker_handle = thread::spawn(move || {
            Self::run_worker(dm_clone, receiver);
        });

        Self {
            disk_manager,
            request_sender: Some(sender),
            worker_handle: Some(worker_handle),
        }
    }

    /// Queues a request for the worker.
    pub fn schedule(&self, request: DiskRequest) -> Result<()> {
        let sender = self
            .request_sender
            .as_ref()
            .ok_or_else(|| BirchError::DiskScheduler("scheduler is shut down".to_string()))?;

        sender
            .send(request)
            .map_err(|e| BirchError::DiskScheduler(format!("Failed to schedule request: {}", e)))
    }

    /// Reads a page and waits for the result.
    pub fn schedule_read_sync(&self, page_id: PageId) -> Result<PageBuf> {
        let (reply, rx) = bounded(1);
        self.schedule(DiskRequest::Read { page_id, reply })?;

        rx.recv()
            .map_err(|e| BirchError::DiskScheduler(format!("Failed to receive completion: {}", e)))?
    }

    /// Writes a page and waits for the result.
    pub fn schedule_write_sync(&self, page_id: PageId, data: PageBuf) -> Result<()> {
        let (reply, rx) = bounded(1);
        self.schedule(DiskRequest::Write {
            page_id,
            data,
            reply,
        })?;

        rx.recv()
            .map_err(|e| BirchError::DiskScheduler(format!("Failed to receive completion: {}", e)))?
    }

    /// Processes requests until every sender is gone.
    fn run_worker(disk_manager: Arc<DiskManager>, receiver: Receiver<DiskRequest>) {
        for request in receiver.iter() {
            Self::process_request(&disk_manager, request);
        }
        debug!("disk scheduler worker exiting");
    }

    fn process_request(disk_manager: &DiskManager, request: DiskRequest) {
        match request {
            DiskRequest::Read { page_id, reply } => {
                let mut data = zeroed_page();
                let result = disk_manager.read_page(page_id, &mut data[..]).map(|_| data);
                if let Err(e) = &result {
                    error!(page_id = page_id.as_u32(), error = %e, "page read failed");
                }
                let _ = reply.send(result);
            }
            DiskRequest::Write {
                page_id,
                data,
                reply,
            } => {
                let result = disk_manager.write_page(page_id, &data[..]);
                if let Err(e) = &result {
                    error!(page_id = page_id.as_u32(), error = %e, "page write failed");
                }
                let _ = reply.send(result);
            }
        }
    }

    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }
}

impl Drop for DiskScheduler {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.request_sender.take();

        if let Some(handle) = self.worker_handle.take() {
            let _ = handle.join();
        }
    }
}
