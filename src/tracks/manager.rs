//! Bridge table
//!
//! Owns every [`TrackBridge`] of a session. An inbound track has at most one
//! bridge, and a participant has at most one bridged track at a time.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::events::EventBus;
use crate::tracks::bridge::{BridgeConfig, BridgeStatus, TrackBridge};
use crate::tracks::{Track, TrackId, TrackState};
use crate::transform::Transform;
use crate::transport::TransportLink;

enum Slot {
    /// Reserved while `TrackBridge::bind` is in flight
    Binding { participant: String },
    Bound(TrackBridge),
}

impl Slot {
    fn participant(&self) -> &str {
        match self {
            Slot::Binding { participant } => participant,
            Slot::Bound(bridge) => &bridge.inbound().participant,
        }
    }
}

#[derive(Default)]
pub struct BridgeManager {
    slots: Mutex<HashMap<TrackId, Slot>>,
}

impl BridgeManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `inbound` to a new bridge
    pub async fn bind(
        &self,
        link: Arc<dyn TransportLink>,
        inbound: &Track,
        transform: Arc<dyn Transform>,
        config: &BridgeConfig,
        events: EventBus,
    ) -> Result<BridgeStatus, BridgeError> {
        if !inbound.is_video() {
            return Err(BridgeError::NotVideo(inbound.id.clone()));
        }
        if inbound.state() != TrackState::Active {
            return Err(BridgeError::NotActive {
                id: inbound.id.clone(),
                state: inbound.state(),
            });
        }

        {
            let mut slots = self.slots.lock();
            if slots.contains_key(&inbound.id) {
                return Err(BridgeError::AlreadyBound(inbound.id.clone()));
            }
            if let Some((existing, _)) = slots
                .iter()
                .find(|(_, slot)| slot.participant() == inbound.participant)
            {
                return Err(BridgeError::ParticipantAlreadyBound {
                    participant: inbound.participant.clone(),
                    existing: existing.clone(),
                });
            }
            slots.insert(
                inbound.id.clone(),
                Slot::Binding {
                    participant: inbound.participant.clone(),
                },
            );
        }

        let bridge = match TrackBridge::bind(link, inbound, transform, config, events).await {
            Ok(bridge) => bridge,
            Err(e) => {
                self.release_reservation(&inbound.id);
                return Err(e);
            }
        };

        let status = bridge.status();
        let orphan = {
            let mut slots = self.slots.lock();
            match slots.get_mut(&inbound.id) {
                Some(slot) if matches!(slot, Slot::Binding { .. }) => {
                    *slot = Slot::Bound(bridge);
                    None
                }
                // Reservation withdrawn by unbind or teardown while binding
                _ => Some(bridge),
            }
        };

        if let Some(bridge) = orphan {
            bridge.unbind().await;
            return Err(BridgeError::Aborted(inbound.id.clone()));
        }

        Ok(status)
    }

    fn release_reservation(&self, track_id: &TrackId) {
        let mut slots = self.slots.lock();
        if matches!(slots.get(track_id), Some(Slot::Binding { .. })) {
            slots.remove(track_id);
        }
    }

    /// Tear down the bridge of `track_id`
    pub async fn unbind(&self, track_id: &TrackId) -> Result<BridgeStatus, BridgeError> {
        let slot = self.slots.lock().remove(track_id);
        match slot {
            Some(Slot::Bound(bridge)) => Ok(bridge.unbind().await),
            // The in-flight bind notices the missing reservation and cleans up
            Some(Slot::Binding { .. }) | None => Err(BridgeError::NotBound(track_id.clone())),
        }
    }

    /// Tear down every bridge, returning their final status
    pub async fn teardown_all(&self) -> Vec<BridgeStatus> {
        let bridges: Vec<TrackBridge> = self
            .slots
            .lock()
            .drain()
            .filter_map(|(_, slot)| match slot {
                Slot::Bound(bridge) => Some(bridge),
                Slot::Binding { .. } => None,
            })
            .collect();

        if !bridges.is_empty() {
            tracing::info!("Tearing down {} bridge(s)", bridges.len());
        }
        join_all(bridges.into_iter().map(TrackBridge::unbind)).await
    }

    pub fn pause_all(&self) {
        for slot in self.slots.lock().values() {
            if let Slot::Bound(bridge) = slot {
                bridge.pause();
            }
        }
    }

    pub fn resume_all(&self) {
        for slot in self.slots.lock().values() {
            if let Slot::Bound(bridge) = slot {
                bridge.resume();
            }
        }
    }

    pub fn get_status(&self, track_id: &TrackId) -> Option<BridgeStatus> {
        match self.slots.lock().get(track_id) {
            Some(Slot::Bound(bridge)) => Some(bridge.status()),
            _ => None,
        }
    }

    /// Status of every bound bridge, sorted by inbound track id
    pub fn get_all_statuses(&self) -> Vec<BridgeStatus> {
        let mut statuses: Vec<BridgeStatus> = self
            .slots
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Bound(bridge) => Some(bridge.status()),
                Slot::Binding { .. } => None,
            })
            .collect();
        statuses.sort_by(|a, b| a.inbound.cmp(&b.inbound));
        statuses
    }

    /// Inbound track ids with a bound bridge, sorted
    pub fn bound_tracks(&self) -> Vec<TrackId> {
        let mut ids: Vec<TrackId> = self
            .slots
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Bound(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn bridge_count(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| matches!(slot, Slot::Bound(_)))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::tracks::{EncodingParams, TrackDirection, TrackKind};
    use crate::transform::Passthrough;
    use crate::transport::{Connection, LoopbackHub, Transport};

    const ADDRESS: &str = "loopback://table";

    async fn join(hub: &LoopbackHub, identity: &str) -> Connection {
        let token = hub.issue_token(identity);
        hub.transport().connect(ADDRESS, &token).await.unwrap()
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            scheduler: SchedulerConfig::default(),
            outbound: EncodingParams::default(),
            outbound_name: "processed".into(),
        }
    }

    /// Publish `id` from `publisher` and return the active inbound view
    async fn remote_camera(publisher: &Connection, id: &str) -> Track {
        let local = Track::new(
            TrackId::new(id),
            publisher.link.local_identity(),
            "camera",
            TrackKind::Video,
            TrackDirection::Outbound,
        );
        publisher.link.publish(&local).await.unwrap();

        let mut inbound = Track::new(
            TrackId::new(id),
            publisher.link.local_identity(),
            "camera",
            TrackKind::Video,
            TrackDirection::Inbound,
        );
        inbound.transition(TrackState::Active).unwrap();
        inbound
    }

    #[tokio::test]
    async fn test_single_bridge_per_track() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;
        let camera = remote_camera(&browser, "TR_cam").await;
        let table = BridgeManager::new();

        table
            .bind(worker.link.clone(), &camera, Arc::new(Passthrough), &config(), EventBus::new())
            .await
            .unwrap();
        assert!(matches!(
            table
                .bind(worker.link.clone(), &camera, Arc::new(Passthrough), &config(), EventBus::new())
                .await,
            Err(BridgeError::AlreadyBound(_))
        ));
        assert_eq!(table.bridge_count(), 1);
        // Only one outbound publication was ever made
        assert_eq!(hub.publish_count(), 2);

        table.unbind(&camera.id).await.unwrap();
        assert!(matches!(table.unbind(&camera.id).await, Err(BridgeError::NotBound(_))));
        assert_eq!(table.bridge_count(), 0);
    }

    #[tokio::test]
    async fn test_single_bridge_per_participant() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;
        let phone = join(&hub, "phone").await;
        let first = remote_camera(&browser, "TR_cam_a").await;
        let second = remote_camera(&browser, "TR_cam_b").await;
        let other = remote_camera(&phone, "TR_phone").await;
        let table = BridgeManager::new();

        table
            .bind(worker.link.clone(), &first, Arc::new(Passthrough), &config(), EventBus::new())
            .await
            .unwrap();
        match table
            .bind(worker.link.clone(), &second, Arc::new(Passthrough), &config(), EventBus::new())
            .await
        {
            Err(BridgeError::ParticipantAlreadyBound { participant, existing }) => {
                assert_eq!(participant, "browser");
                assert_eq!(existing, first.id);
            }
            other => panic!("unexpected {:?}", other.map(|s| s.inbound)),
        }
        table
            .bind(worker.link.clone(), &other, Arc::new(Passthrough), &config(), EventBus::new())
            .await
            .unwrap();

        assert_eq!(table.bound_tracks(), vec![first.id.clone(), other.id.clone()]);
        let statuses = table.teardown_all().await;
        assert_eq!(statuses.len(), 2);
        assert_eq!(table.bridge_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_bind_releases_reservation() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;
        let camera = remote_camera(&browser, "TR_cam").await;
        let table = BridgeManager::new();

        hub.fail_next_publishes(1);
        assert!(matches!(
            table
                .bind(worker.link.clone(), &camera, Arc::new(Passthrough), &config(), EventBus::new())
                .await,
            Err(BridgeError::Publish(_))
        ));

        table
            .bind(worker.link.clone(), &camera, Arc::new(Passthrough), &config(), EventBus::new())
            .await
            .unwrap();
        assert_eq!(table.bridge_count(), 1);
        table.teardown_all().await;
    }

    #[tokio::test]
    async fn test_pause_and_resume_all() {
        let hub = LoopbackHub::new(ADDRESS);
        let worker = join(&hub, "worker").await;
        let browser = join(&hub, "browser").await;
        let camera = remote_camera(&browser, "TR_cam").await;
        let table = BridgeManager::new();
        table
            .bind(worker.link.clone(), &camera, Arc::new(Passthrough), &config(), EventBus::new())
            .await
            .unwrap();

        table.pause_all();
        assert!(table.get_status(&camera.id).unwrap().paused);
        table.resume_all();
        assert!(!table.get_all_statuses()[0].paused);
        table.teardown_all().await;
    }
}
