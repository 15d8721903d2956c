pub mod image_loader;

use super::model::sam::prompt::Prompt;
use super::model::{predict_best, Segmenter};
use crate::error::{Error, Result};

use image::{DynamicImage, GrayImage};
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{self, Receiver, Sender},
    thread,
};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

pub enum Command {
    Segment {
        img: DynamicImage,
        prompt: Prompt,
        reply: oneshot::Sender<Result<GrayImage>>,
    },
    End,
}

/// Handle to the thread that owns the segmentation model.
///
/// Every request goes through one queue, so `set_image` and `predict` never
/// interleave between requests. Cloning the handle shares the queue.
#[derive(Clone)]
pub struct SegmentWorker {
    sender: Sender<Command>,
}

struct ComputationData {
    model: Box<dyn Segmenter>,
    receiver: Receiver<Command>,
}

pub fn run(model: Box<dyn Segmenter>) -> Result<SegmentWorker> {
    let (sender, receiver) = mpsc::channel::<Command>();
    let mut data = ComputationData { model, receiver };

    thread::Builder::new()
        .name("segment-worker".into())
        .spawn(move || {
            while let Ok(task) = data.receiver.recv() {
                match task {
                    Command::End => break,
                    task => data.run_task(task),
                }
            }
            info!("segment worker stopped");
        })?;

    Ok(SegmentWorker { sender })
}

/// Runs image decoding, compositing and file writes off the async executor.
pub async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?
}

impl SegmentWorker {
    pub async fn segment(&self, img: DynamicImage, prompt: Prompt) -> Result<GrayImage> {
        let (reply, result) = oneshot::channel();
        self.sender
            .send(Command::Segment { img, prompt, reply })
            .map_err(|_| Error::ModelInference("segment worker is not running".into()))?;

        result
            .await
            .map_err(|_| Error::ModelInference("segment worker dropped the request".into()))?
    }

    pub fn stop(&self) {
        // a closed queue means the worker is already gone
        let _ = self.sender.send(Command::End);
    }
}

impl ComputationData {
    fn run_task(&mut self, task: Command) {
        let timer = std::time::Instant::now();
        let msg = task.to_string();

        if let Command::Segment { img, prompt, reply } = task {
            // a panicking model fails this request, the worker keeps serving
            let ret = panic::catch_unwind(AssertUnwindSafe(|| {
                predict_best(self.model.as_mut(), &img, &prompt)
            }))
            .unwrap_or_else(|cause| {
                let cause = panic_message(&*cause);
                error!("segmentation model panicked on {msg}: {cause}");
                Err(Error::ModelInference(format!("model panicked: {cause}")))
            });
            // the requester may have gone away, nothing to do then
            let _ = reply.send(ret);
        }

        debug!("Time elapsed for {msg}: {:?}", timer.elapsed());
    }
}

fn panic_message(cause: &(dyn Any + Send)) -> String {
    if let Some(s) = cause.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = cause.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Segment { prompt, .. } => write!(
                f,
                "Segment ({} points, box: {})",
                prompt.points().len(),
                prompt.bbox().is_some()
            ),
            Command::End => write!(f, "End"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::model::sam::prompt::PointPrompt;
    use crate::app::model::testing::Scripted;
    use crate::app::model::{CandidateSet, Segmenter};

    fn prompt() -> Prompt {
        Prompt::new(vec![PointPrompt::positive(1.0, 1.0)], None).unwrap()
    }

    #[tokio::test]
    async fn concurrent_requests_are_served_one_at_a_time() {
        let worker = run(Box::new(Scripted::new(vec![(255, 0.9)]))).unwrap();

        let mut handles = Vec::new();
        for size in 1..=8u32 {
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                let img = DynamicImage::new_rgb8(size * 3, size * 2);
                let mask = worker.segment(img, prompt()).await.unwrap();
                assert_eq!(mask.dimensions(), (size * 3, size * 2));
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        worker.stop();
    }

    /// Panics on the first image, behaves afterwards.
    struct PanicsOnce {
        inner: Scripted,
        panicked: bool,
    }

    impl Segmenter for PanicsOnce {
        fn set_image(&mut self, img: &DynamicImage) -> Result<()> {
            if !self.panicked {
                self.panicked = true;
                panic!("onnx runtime exploded");
            }
            self.inner.set_image(img)
        }

        fn predict(&mut self, prompt: &Prompt) -> Result<CandidateSet> {
            self.inner.predict(prompt)
        }
    }

    #[tokio::test]
    async fn model_panic_fails_one_request_only() {
        let worker = run(Box::new(PanicsOnce {
            inner: Scripted::new(vec![(255, 0.9)]),
            panicked: false,
        }))
        .unwrap();

        let first = worker.segment(DynamicImage::new_rgb8(4, 4), prompt()).await;
        match first {
            Err(Error::ModelInference(msg)) => assert!(msg.contains("onnx runtime exploded")),
            other => panic!("expected an inference error, got {:?}", other.map(|m| m.dimensions())),
        }

        let second = worker.segment(DynamicImage::new_rgb8(4, 4), prompt()).await.unwrap();
        assert_eq!(second.dimensions(), (4, 4));
        worker.stop();
    }

    #[tokio::test]
    async fn blocking_work_returns_its_result() {
        let n = blocking(|| Ok(6 * 7)).await.unwrap();
        assert_eq!(n, 42);

        let err = blocking(|| -> Result<()> { Err(Error::Validation("nope".into())) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn stopped_worker_reports_inference_error() {
        let worker = run(Box::new(Scripted::new(vec![(255, 0.9)]))).unwrap();
        worker.stop();
        // give the thread a moment to drain the End command
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let res = worker.segment(DynamicImage::new_rgb8(2, 2), prompt()).await;
        assert!(matches!(res, Err(Error::ModelInference(_))));
    }
}
