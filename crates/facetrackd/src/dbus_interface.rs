use crate::engine::{EngineError, EngineHandle};
use facetrack_core::{EnrollError, EnrollForm, PointerEvent};
use zbus::interface;

/// D-Bus interface for the facetrack daemon.
///
/// Bus name: org.facetrack.Tracker1
/// Object path: /org/facetrack/Tracker1
pub struct TrackerService {
    pub engine: EngineHandle,
}

fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    match e {
        EngineError::Enroll(
            EnrollError::EmptyName
            | EnrollError::InvalidAge(_)
            | EnrollError::ImageTooLarge(_)
            | EnrollError::NoFaceDetected
            | EnrollError::Image(_),
        )
        | EngineError::NoPendingCapture => zbus::fdo::Error::InvalidArgs(e.to_string()),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

/// Empty strings and negative ages mean "not given".
fn enroll_form(name: &str, age: i32, gender: &str) -> EnrollForm {
    EnrollForm {
        name: name.to_string(),
        age: u32::try_from(age).ok(),
        gender: Some(gender.trim())
            .filter(|g| !g.is_empty())
            .map(str::to_string),
    }
}

#[interface(name = "org.facetrack.Tracker1")]
impl TrackerService {
    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let status = self.engine.status().await.map_err(to_fdo)?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "state": status.state,
            "camera": status.camera_device,
            "frame_width": status.frame_width,
            "frame_height": status.frame_height,
            "embedding_profile": status.embedding_profile,
            "gallery_size": status.gallery_size,
            "pending_capture": status.pending_capture,
        })
        .to_string())
    }

    /// Current recognition result, or `null` when no face is in view.
    async fn recognition(&self) -> zbus::fdo::Result<String> {
        let result = self.engine.recognition().await.map_err(to_fdo)?;
        to_json(&result)
    }

    /// Current overlay drawing instructions, or `null`.
    async fn overlay(&self) -> zbus::fdo::Result<String> {
        let overlay = self.engine.overlay().await.map_err(to_fdo)?;
        to_json(&overlay)
    }

    /// Claim the face under the pointer for enrollment. Returns `null` when
    /// the pointer missed or the face is already known.
    async fn claim(&self, x: f64, y: f64, display_width: f64) -> zbus::fdo::Result<String> {
        tracing::debug!(x, y, display_width, "claim requested");
        let pointer = PointerEvent {
            x: x as f32,
            y: y as f32,
            display_width: display_width as f32,
        };
        let summary = self.engine.claim(pointer).await.map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Enroll the last claimed face. Returns the new record id.
    async fn enroll(&self, name: &str, age: i32, gender: &str) -> zbus::fdo::Result<String> {
        tracing::info!(name, "enroll requested");
        self.engine
            .enroll(enroll_form(name, age, gender))
            .await
            .map_err(to_fdo)
    }

    /// Enroll from an encoded still image. Returns the new record id.
    async fn enroll_image(
        &self,
        name: &str,
        age: i32,
        gender: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(name, bytes = image.len(), "enroll_image requested");
        self.engine
            .enroll_image(enroll_form(name, age, gender), image)
            .await
            .map_err(to_fdo)
    }

    /// List enrolled faces, newest first, without descriptors or images.
    async fn list_faces(&self) -> zbus::fdo::Result<String> {
        let faces = self.engine.list_faces().await.map_err(to_fdo)?;
        let listed: Vec<_> = faces
            .iter()
            .map(|face| {
                serde_json::json!({
                    "id": face.id,
                    "name": face.record.name,
                    "age": face.record.age,
                    "gender": face.record.gender,
                    "created_at": face.record.created_at,
                    "has_descriptor": face.record.descriptor.is_some(),
                })
            })
            .collect();
        Ok(serde_json::Value::from(listed).to_string())
    }

    /// Remove an enrolled face by id. Returns false if there was none.
    async fn remove_face(&self, id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(id, "remove_face requested");
        self.engine.remove_face(id.to_string()).await.map_err(to_fdo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enroll_form_unset_fields() {
        let form = enroll_form("Ann", -1, "  ");
        assert_eq!(form.name, "Ann");
        assert_eq!(form.age, None);
        assert_eq!(form.gender, None);

        let form = enroll_form("Ben", 34, "male");
        assert_eq!(form.age, Some(34));
        assert_eq!(form.gender.as_deref(), Some("male"));
    }

    #[test]
    fn test_user_errors_map_to_invalid_args() {
        assert!(matches!(
            to_fdo(EngineError::NoPendingCapture),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(EngineError::Enroll(EnrollError::EmptyName)),
            zbus::fdo::Error::InvalidArgs(_)
        ));
        assert!(matches!(
            to_fdo(EngineError::ChannelClosed),
            zbus::fdo::Error::Failed(_)
        ));
    }
}
