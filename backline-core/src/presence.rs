//! Collaborator presence records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::document::UserId;

/// Display colour for a collaborator's avatar and field highlight.
///
/// Derived from the user id in HSL space (fixed saturation/lightness) so
/// every client assigns the same colour to the same person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PresenceColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl PresenceColor {
    pub fn from_user(id: UserId) -> Self {
        let hue = ((id.as_u128() % 360) as f32) / 360.0;
        let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.55);
        Self {
            r: (r * 255.0).round() as u8,
            g: (g * 255.0).round() as u8,
            b: (b * 255.0).round() as u8,
        }
    }

    /// `#rrggbb`
    pub fn to_hex(&self) -> String {
        format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b)
    }
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    if s == 0.0 {
        return (l, l, l);
    }

    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;

    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

/// What the local user is doing right now. Sent through the presence
/// channel; the channel stamps it into a [`PresenceUser`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PresenceState {
    pub editing_field: Option<String>,
    pub cursor: Option<u32>,
}

impl PresenceState {
    pub fn editing(field: impl Into<String>, cursor: Option<u32>) -> Self {
        Self {
            editing_field: Some(field.into()),
            cursor,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.editing_field.is_none() && self.cursor.is_none()
    }
}

/// One connected collaborator as seen in the roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceUser {
    pub user_id: UserId,
    pub display_name: String,
    pub color: PresenceColor,
    pub editing_field: Option<String>,
    pub cursor: Option<u32>,
    pub last_active: DateTime<Utc>,
}

impl PresenceUser {
    pub fn new(user_id: UserId, display_name: impl Into<String>) -> Self {
        Self {
            user_id,
            display_name: display_name.into(),
            color: PresenceColor::from_user(user_id),
            editing_field: None,
            cursor: None,
            last_active: Utc::now(),
        }
    }

    /// Anonymous share-link visitor.
    pub fn guest() -> Self {
        let id = Uuid::new_v4();
        Self::new(id, format!("Guest-{}", &id.to_string()[..8]))
    }

    /// Fold a presence state in and refresh `last_active`.
    pub fn apply_state(&mut self, state: &PresenceState) {
        self.editing_field = state.editing_field.clone();
        self.cursor = state.cursor;
        self.last_active = Utc::now();
    }

    pub fn state(&self) -> PresenceState {
        PresenceState {
            editing_field: self.editing_field.clone(),
            cursor: self.cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_color_stable_for_user() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(PresenceColor::from_user(id), PresenceColor::from_user(id));
    }

    #[test]
    fn test_color_hex_format() {
        let hex = PresenceColor { r: 255, g: 0, b: 16 }.to_hex();
        assert_eq!(hex, "#ff0010");
    }

    #[test]
    fn test_hsl_red() {
        let (r, g, b) = hsl_to_rgb(0.0, 1.0, 0.5);
        assert!((r - 1.0).abs() < 0.01);
        assert!(g.abs() < 0.01);
        assert!(b.abs() < 0.01);
    }

    #[test]
    fn test_apply_state_refreshes_activity() {
        let mut user = PresenceUser::new(Uuid::new_v4(), "sam@venue.example");
        let before = user.last_active;
        user.apply_state(&PresenceState::editing("input_list", Some(4)));
        assert_eq!(user.editing_field.as_deref(), Some("input_list"));
        assert_eq!(user.cursor, Some(4));
        assert!(user.last_active >= before);

        user.apply_state(&PresenceState::default());
        assert!(user.state().is_idle());
    }

    #[test]
    fn test_guest_name() {
        let guest = PresenceUser::guest();
        assert!(guest.display_name.starts_with("Guest-"));
    }
}
