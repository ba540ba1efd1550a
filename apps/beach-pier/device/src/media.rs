//! Camera frame fan-out.

use std::{path::PathBuf, time::Duration};

use beach_pier_core::ClientId;
use metrics::counter;
use tokio::{
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::endpoint::{BroadcastReport, RelayEndpoint, Topic};

/// Delivers each captured frame to every endpoint that carries camera media.
#[derive(Clone, Default)]
pub struct CameraHub {
    endpoints: Vec<RelayEndpoint>,
}

impl CameraHub {
    pub fn new(endpoints: Vec<RelayEndpoint>) -> Self {
        Self { endpoints }
    }

    /// True when at least one LAN client or a connected tunnel could receive
    /// a frame, so capture can be skipped otherwise.
    pub fn has_audience(&self) -> bool {
        self.endpoints.iter().any(|endpoint| {
            let tunnel_wants = endpoint.tunnel().is_some_and(|tunnel| tunnel.is_connected())
                && (endpoint.has_topic(ClientId::TUNNEL, Topic::Camera)
                    || endpoint.has_topic(ClientId::TUNNEL, Topic::CameraSnapshot));
            tunnel_wants
                || endpoint.subscriber_count(Topic::Camera) > 0
                || endpoint.subscriber_count(Topic::CameraSnapshot) > 0
        })
    }

    pub async fn publish(&self, jpeg: Vec<u8>) -> BroadcastReport {
        let mut total = BroadcastReport::default();
        for endpoint in &self.endpoints {
            match endpoint.publish_topic(Topic::Camera, jpeg.clone()).await {
                Ok(report) => {
                    total.delivered += report.delivered;
                    total.dropped += report.dropped;
                    total.removed += report.removed;
                }
                Err(err) => {
                    counter!("beach_pier_camera_frames_rejected_total", 1, "path" => endpoint.path().to_string());
                    debug!(path = %endpoint.path(), error = %err, "camera frame rejected");
                }
            }
        }
        total
    }
}

/// Replays the JPEG files of a directory, in name order, as a camera feed.
pub struct FrameDirSource {
    dir: PathBuf,
    period: Duration,
}

impl FrameDirSource {
    pub fn new(dir: impl Into<PathBuf>, fps: u32) -> Self {
        Self {
            dir: dir.into(),
            period: Duration::from_millis(1000 / u64::from(fps.max(1))),
        }
    }

    pub async fn frames(&self) -> std::io::Result<Vec<PathBuf>> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut frames = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let is_jpeg = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"));
            if is_jpeg {
                frames.push(path);
            }
        }
        frames.sort();
        Ok(frames)
    }

    pub fn spawn(self, hub: CameraHub) -> JoinHandle<()> {
        tokio::spawn(async move {
            let frames = match self.frames().await {
                Ok(frames) if !frames.is_empty() => frames,
                Ok(_) => {
                    warn!(dir = %self.dir.display(), "no jpeg frames found; camera feed idle");
                    return;
                }
                Err(err) => {
                    warn!(dir = %self.dir.display(), error = %err, "cannot read camera frames");
                    return;
                }
            };
            info!(dir = %self.dir.display(), frames = frames.len(), "camera replay started");

            let mut ticker = interval(self.period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            for path in frames.iter().cycle() {
                ticker.tick().await;
                if !hub.has_audience() {
                    continue;
                }
                match tokio::fs::read(path).await {
                    Ok(jpeg) => {
                        hub.publish(jpeg).await;
                    }
                    Err(err) => debug!(frame = %path.display(), error = %err, "frame unreadable"),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{EndpointLimits, FrameHandler, LocalServer, CLIENT_QUEUE_DEPTH};
    use async_trait::async_trait;
    use axum::extract::ws::Message;
    use beach_pier_core::Frame;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct Quiet;

    #[async_trait]
    impl FrameHandler for Quiet {
        async fn on_frame(&self, _endpoint: &RelayEndpoint, _client: ClientId, _frame: Frame) {}
    }

    fn limits() -> EndpointLimits {
        EndpointLimits {
            max_clients: 4,
            max_message_len: 0,
            max_broadcast_len: 1024,
        }
    }

    #[tokio::test]
    async fn hub_reaches_subscribers_on_every_endpoint() {
        let server = LocalServer::new();
        let camera = server.begin("/ws/camera", limits(), None, Arc::new(Quiet)).unwrap();
        let control = server.begin("/ws/control", limits(), None, Arc::new(Quiet)).unwrap();
        let hub = CameraHub::new(vec![camera.clone(), control.clone()]);
        assert!(!hub.has_audience());

        let (tx_cam, mut rx_cam) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let cam_id = camera.accept(tx_cam);
        camera.set_topic(cam_id, Topic::Camera, true);
        let (tx_ctl, mut rx_ctl) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let (tx_idle, mut rx_idle) = mpsc::channel(CLIENT_QUEUE_DEPTH);
        let ctl_id = control.accept(tx_ctl);
        control.accept(tx_idle);
        control.set_topic(ctl_id, Topic::CameraSnapshot, true);
        assert!(hub.has_audience());

        let report = hub.publish(vec![0xff, 0xd8]).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(rx_cam.try_recv().unwrap(), Message::Binary(vec![0xff, 0xd8]));
        assert_eq!(rx_ctl.try_recv().unwrap(), Message::Binary(vec![0xff, 0xd8]));
        assert!(rx_idle.try_recv().is_err());

        let report = hub.publish(vec![1]).await;
        assert_eq!(report.delivered, 1);
    }

    #[tokio::test]
    async fn frame_dir_lists_jpegs_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.jpg", "a.JPEG", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let source = FrameDirSource::new(dir.path(), 5);
        let frames = source.frames().await.unwrap();
        let names: Vec<_> = frames
            .iter()
            .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["a.JPEG", "b.jpg"]);
    }
}
