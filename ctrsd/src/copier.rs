use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::crypto::CryptoTransform;
use crate::{Error, Result};

use log::error;

/// Progress report signature: (processed bytes, total bytes).
pub type ProgressCallback<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// A no-op progress callback for callers that do not track progress.
pub fn no_progress() -> &'static ProgressCallback<'static> {
    &|_, _| {}
}

/// Maps the per-file progress of consecutive transfers onto one overall
/// (done, total) report.
pub struct ProgressWrapper {
    total_size: u64,
    current_done_size: AtomicU64,
    current_pending_size: AtomicU64,
}

impl ProgressWrapper {
    #[must_use]
    pub fn new(total_size: u64) -> Self {
        Self {
            total_size,
            current_done_size: AtomicU64::new(0),
            current_pending_size: AtomicU64::new(0),
        }
    }

    pub fn set_current(&self, current: u64) {
        self.current_done_size.store(current, Ordering::SeqCst);
        self.current_pending_size.store(0, Ordering::SeqCst);
    }

    /// Wraps `callback`; call once per transfer. The previous transfer's
    /// pending size is folded into the running total.
    pub fn wrap<'a>(
        &'a self,
        callback: &'a ProgressCallback<'a>,
    ) -> impl Fn(u64, u64) + Send + Sync + 'a {
        let pending = self.current_pending_size.swap(0, Ordering::SeqCst);
        self.current_done_size.fetch_add(pending, Ordering::SeqCst);
        move |current, total| {
            self.current_pending_size.store(total, Ordering::SeqCst);
            callback(
                current + self.current_done_size.load(Ordering::SeqCst),
                self.total_size,
            );
        }
    }
}

/// Frame size shared by the three pipeline stages.
const BUFFER_SIZE: usize = 16 * 1024;
const BUFFER_COUNT: usize = 3;
/// The number of frames each progress report covers. 32 * 16K = 512K
const PROGRESS_REPORT_FREQ: u64 = 32;

/// Manual-reset event in the style of the barrier objects the pipeline
/// threads coordinate through.
pub(crate) struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.signaled.lock().unwrap() = true;
        self.condvar.notify_all();
    }

    fn reset(&self) {
        *self.signaled.lock().unwrap() = false;
    }

    fn wait(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            signaled = self.condvar.wait(signaled).unwrap();
        }
        // Consume the signal so the barrier can be reused for the next frame
        *signaled = false;
    }
}

/// Shared state a copy operation can be cancelled through from another
/// thread.
pub struct CopyControl {
    running: AtomicBool,
    good: AtomicBool,
    completion: Event,
    read_done: [Event; BUFFER_COUNT],
    transform_done: [Event; BUFFER_COUNT],
    write_done: [Event; BUFFER_COUNT],
    failure: Mutex<Option<Error>>,
}

impl CopyControl {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            good: AtomicBool::new(true),
            completion: Event::new(),
            read_done: [Event::new(), Event::new(), Event::new()],
            transform_done: [Event::new(), Event::new(), Event::new()],
            write_done: [Event::new(), Event::new(), Event::new()],
            failure: Mutex::new(None),
        }
    }

    fn reset(&self) {
        for event in self
            .read_done
            .iter()
            .chain(self.transform_done.iter())
            .chain(self.write_done.iter())
        {
            event.reset();
        }
        self.completion.reset();
        self.good.store(true, Ordering::SeqCst);
        *self.failure.lock().unwrap() = None;
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Marks the operation failed and wakes every waiter.
    fn fail(&self, error: Error) {
        self.good.store(false, Ordering::SeqCst);
        let mut failure = self.failure.lock().unwrap();
        if failure.is_none() {
            *failure = Some(error);
        }
        drop(failure);
        self.wake_all();
    }

    fn wake_all(&self) {
        for event in self
            .read_done
            .iter()
            .chain(self.transform_done.iter())
            .chain(self.write_done.iter())
        {
            event.set();
        }
        self.completion.set();
    }

    /// Cooperative cancellation; the workers observe the cleared run flag at
    /// their next suspension point and unwind.
    pub fn abort(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.good.store(false, Ordering::SeqCst);
            self.wake_all();
        }
    }
}

/// Generalized threaded file copier.
///
/// Reads, optionally transforms and writes data using three worker threads
/// over a triple buffer, reporting progress from the writer stage. The
/// transform is consumed by each run; a run without one is a plain copy.
pub struct FileCopier {
    control: Arc<CopyControl>,
    transform: Option<CryptoTransform>,
    /// Total size of the current content, which may span multiple files.
    total_size: u64,
    imported_size: Arc<AtomicU64>,
}

impl Default for FileCopier {
    fn default() -> Self {
        Self::new()
    }
}

impl FileCopier {
    #[must_use]
    pub fn new() -> Self {
        Self {
            control: Arc::new(CopyControl::new()),
            transform: None,
            total_size: 0,
            imported_size: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle for cancelling an in-flight run from another thread.
    #[must_use]
    pub fn control(&self) -> Arc<CopyControl> {
        Arc::clone(&self.control)
    }

    pub fn abort(&self) {
        self.control.abort();
    }

    /// Sets the transform for the next run. `None` means plain copy.
    pub fn set_transform(&mut self, transform: Option<CryptoTransform>) {
        self.transform = transform;
    }

    /// Takes back the transform of the previous run, e.g. to read out an
    /// accumulated hash.
    pub fn take_transform(&mut self) -> Option<CryptoTransform> {
        self.transform.take()
    }

    /// Restarts the progress accounting for a new content.
    pub fn reset(&mut self, total_size: u64) {
        self.total_size = total_size;
        self.imported_size.store(0, Ordering::SeqCst);
    }

    /// Reads `size` bytes from `source`, runs them through the transform and
    /// writes them to `dest`. Blocks until done, failed or aborted.
    pub fn run<R, W>(
        &mut self,
        source: &mut R,
        size: u64,
        dest: &mut W,
        callback: &ProgressCallback<'_>,
    ) -> Result<()>
    where
        R: Read + Send,
        W: Write + Send,
    {
        if self.control.is_running() {
            error!("Copier is already running");
            return Err(Error::Aborted);
        }
        if size == 0 {
            return Ok(());
        }

        self.control.reset();
        self.control.running.store(true, Ordering::SeqCst);

        let buffers: [Mutex<Vec<u8>>; BUFFER_COUNT] = [
            Mutex::new(vec![0u8; BUFFER_SIZE]),
            Mutex::new(vec![0u8; BUFFER_SIZE]),
            Mutex::new(vec![0u8; BUFFER_SIZE]),
        ];
        let control = &*self.control;
        let has_transform = self.transform.is_some();
        let mut transform = self.transform.take();
        let imported = Arc::clone(&self.imported_size);
        let total_size = self.total_size;

        thread::scope(|scope| {
            scope.spawn(|| {
                read_loop(control, &buffers, source, size);
            });
            if has_transform {
                let transform = transform.as_mut().unwrap();
                scope.spawn(|| {
                    transform_loop(control, &buffers, transform, size);
                });
            }
            scope.spawn(|| {
                write_loop(
                    control,
                    &buffers,
                    dest,
                    size,
                    has_transform,
                    &imported,
                    total_size,
                    callback,
                );
            });

            control.completion.wait();
            // Unblock stages that are still parked on a barrier
            control.running.store(false, Ordering::SeqCst);
            control.wake_all();
        });

        self.transform = transform;

        if self.control.good.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(self
                .control
                .failure
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Error::Aborted))
        }
    }
}

fn frame_len(size: u64, remaining: u64) -> usize {
    debug_assert!(size >= remaining);
    (remaining.min(BUFFER_SIZE as u64)) as usize
}

fn read_loop<R: Read>(
    control: &CopyControl,
    buffers: &[Mutex<Vec<u8>>; BUFFER_COUNT],
    source: &mut R,
    size: u64,
) {
    let mut current = 0usize;
    let mut is_first_run = true;
    let mut remaining = size;

    while control.is_running() && remaining > 0 {
        if is_first_run {
            if current == BUFFER_COUNT - 1 {
                is_first_run = false;
            }
        } else {
            control.write_done[current].wait();
            if !control.is_running() {
                return;
            }
        }

        let to_read = frame_len(size, remaining);
        {
            let mut buffer = buffers[current].lock().unwrap();
            if let Err(e) = source.read_exact(&mut buffer[..to_read]) {
                control.fail(e.into());
                return;
            }
        }
        remaining -= to_read as u64;

        control.read_done[current].set();
        current = (current + 1) % BUFFER_COUNT;
    }
}

fn transform_loop(
    control: &CopyControl,
    buffers: &[Mutex<Vec<u8>>; BUFFER_COUNT],
    transform: &mut CryptoTransform,
    size: u64,
) {
    let mut current = 0usize;
    let mut remaining = size;

    while control.is_running() && remaining > 0 {
        control.read_done[current].wait();
        if !control.is_running() {
            return;
        }

        let to_process = frame_len(size, remaining);
        transform.process(&mut buffers[current].lock().unwrap()[..to_process]);
        remaining -= to_process as u64;

        control.transform_done[current].set();
        current = (current + 1) % BUFFER_COUNT;
    }
}

#[allow(clippy::too_many_arguments)]
fn write_loop<W: Write>(
    control: &CopyControl,
    buffers: &[Mutex<Vec<u8>>; BUFFER_COUNT],
    dest: &mut W,
    size: u64,
    has_transform: bool,
    imported: &AtomicU64,
    total_size: u64,
    callback: &ProgressCallback<'_>,
) {
    let mut current = 0usize;
    let mut remaining = size;
    let mut iteration = 0u64;

    while control.is_running() && remaining > 0 {
        if iteration % PROGRESS_REPORT_FREQ == 0 {
            callback(imported.load(Ordering::SeqCst), total_size);
        }
        iteration += 1;

        if has_transform {
            control.transform_done[current].wait();
        } else {
            control.read_done[current].wait();
        }
        if !control.is_running() {
            return;
        }

        let to_write = frame_len(size, remaining);
        {
            let buffer = buffers[current].lock().unwrap();
            if let Err(e) = dest.write_all(&buffer[..to_write]) {
                control.fail(e.into());
                return;
            }
        }
        remaining -= to_write as u64;
        imported.fetch_add(to_write as u64, Ordering::SeqCst);

        control.write_done[current].set();
        current = (current + 1) % BUFFER_COUNT;
    }

    control.completion.set();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{self, CryptoTransform};
    use std::io::Cursor;

    #[test]
    fn plain_copy_is_identity() {
        let data: Vec<u8> = (0..100_000u32).map(|v| v as u8).collect();
        let mut source = Cursor::new(data.clone());
        let mut dest = Vec::new();

        let mut copier = FileCopier::new();
        copier.reset(data.len() as u64);
        copier
            .run(&mut source, data.len() as u64, &mut dest, no_progress())
            .unwrap();
        assert_eq!(dest, data);
    }

    #[test]
    fn empty_copy_succeeds_and_writes_nothing() {
        let mut source = Cursor::new(Vec::new());
        let mut dest = Vec::new();
        let mut copier = FileCopier::new();
        copier.run(&mut source, 0, &mut dest, no_progress()).unwrap();
        assert!(dest.is_empty());
    }

    #[test]
    fn ctr_transform_round_trips_through_two_copies() {
        let key = [7u8; 0x10];
        let ctr = [9u8; 0x10];
        let data: Vec<u8> = (0..50_000u32).map(|v| (v * 13) as u8).collect();

        let mut copier = FileCopier::new();
        copier.reset(data.len() as u64);

        let mut encrypted = Vec::new();
        copier.set_transform(Some(CryptoTransform::aes_ctr(&key, &ctr, 0)));
        copier
            .run(
                &mut Cursor::new(data.clone()),
                data.len() as u64,
                &mut encrypted,
                no_progress(),
            )
            .unwrap();
        assert_ne!(encrypted, data);

        let mut expected = data.clone();
        crypto::ctr_crypt(&key, &ctr, &mut expected);
        assert_eq!(encrypted, expected);

        copier.reset(data.len() as u64);
        copier.set_transform(Some(CryptoTransform::aes_ctr(&key, &ctr, 0)));
        let mut decrypted = Vec::new();
        copier
            .run(
                &mut Cursor::new(encrypted),
                data.len() as u64,
                &mut decrypted,
                no_progress(),
            )
            .unwrap();
        assert_eq!(decrypted, data);
    }

    #[test]
    fn short_source_fails() {
        let data = vec![1u8; 100];
        let mut dest = Vec::new();
        let mut copier = FileCopier::new();
        let result = copier.run(&mut Cursor::new(data), 200, &mut dest, no_progress());
        assert!(result.is_err());
    }

    #[test]
    fn progress_reaches_written_total() {
        use std::sync::atomic::AtomicU64;

        let data = vec![3u8; BUFFER_SIZE * 40];
        let seen = AtomicU64::new(0);
        let callback = |done: u64, _total: u64| {
            seen.fetch_max(done, Ordering::SeqCst);
        };

        let mut copier = FileCopier::new();
        copier.reset(data.len() as u64);
        let mut dest = Vec::new();
        copier
            .run(
                &mut Cursor::new(data.clone()),
                data.len() as u64,
                &mut dest,
                &callback,
            )
            .unwrap();
        // The writer reports every 32 frames; the last report covers at
        // least all frames before it.
        assert!(seen.load(Ordering::SeqCst) >= (BUFFER_SIZE * 32) as u64);
        assert_eq!(dest.len(), data.len());
    }
}
