//! Accessibility elements seen on a system surface.
//!
//! The dialog suppressor and the foreground probe both read the simulator's
//! accessibility tree. These types mirror the JSON emitted by `axe
//! describe-ui` and add the few queries those components need.

use serde::{Deserialize, Serialize};

/// A node of the accessibility hierarchy.
///
/// Elements form a tree via the `children` field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UIElement {
    /// The unique accessibility identifier (AXUniqueId).
    #[serde(rename = "AXUniqueId", default)]
    pub identifier: Option<String>,

    /// The accessibility label (AXLabel), typically the user-visible text.
    #[serde(rename = "AXLabel", default)]
    pub label: Option<String>,

    /// The element value (AXValue).
    #[serde(rename = "AXValue", default)]
    pub value: Option<String>,

    /// The element type (e.g., "Button", "Alert", "Sheet").
    #[serde(rename = "type", default)]
    pub element_type: Option<String>,

    /// Position and size in screen points.
    #[serde(default)]
    pub frame: Option<ElementFrame>,

    /// Child elements.
    #[serde(default)]
    pub children: Vec<UIElement>,

    /// The accessibility role (e.g., "AXButton", "AXDialog").
    #[serde(default)]
    pub role: Option<String>,
}

impl UIElement {
    /// Whether the element is a button.
    pub fn is_button(&self) -> bool {
        self.element_type.as_deref() == Some("Button") || self.role.as_deref() == Some("AXButton")
    }

    /// Whether the element is a system alert or sheet container.
    pub fn is_alert_container(&self) -> bool {
        matches!(self.element_type.as_deref(), Some("Alert") | Some("Sheet"))
            || matches!(self.role.as_deref(), Some("AXDialog") | Some("AXAlert") | Some("AXSheet"))
    }

    /// Whether this element or any descendant shows `text` as its label or value.
    pub fn contains_text(&self, text: &str) -> bool {
        self.label.as_deref() == Some(text)
            || self.value.as_deref() == Some(text)
            || self.children.iter().any(|child| child.contains_text(text))
    }
}

/// The frame (position and dimensions) of a UI element.
///
/// Coordinates are in screen points, with the origin at the top-left
/// corner of the screen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementFrame {
    /// The x-coordinate of the top-left corner.
    pub x: f64,
    /// The y-coordinate of the top-left corner.
    pub y: f64,
    /// Width in points.
    pub width: f64,
    /// Height in points.
    pub height: f64,
}

impl ElementFrame {
    /// Center point, rounded to whole points.
    pub fn center(&self) -> (i32, i32) {
        (
            (self.x + self.width / 2.0).round() as i32,
            (self.y + self.height / 2.0).round() as i32,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_axe_json() {
        let json = r#"{
            "AXLabel": "Allow",
            "type": "Button",
            "frame": {"x": 10.0, "y": 20.0, "width": 100.0, "height": 41.0}
        }"#;
        let element: UIElement = serde_json::from_str(json).unwrap();
        assert_eq!(element.label.as_deref(), Some("Allow"));
        assert!(element.is_button());
        assert!(element.children.is_empty());
        assert_eq!(element.frame.unwrap().center(), (60, 41));
    }

    #[test]
    fn alert_container_by_type_or_role() {
        let by_type = UIElement {
            element_type: Some("Alert".into()),
            ..Default::default()
        };
        let by_role = UIElement {
            role: Some("AXDialog".into()),
            ..Default::default()
        };
        let plain = UIElement {
            element_type: Some("Window".into()),
            ..Default::default()
        };
        assert!(by_type.is_alert_container());
        assert!(by_role.is_alert_container());
        assert!(!plain.is_alert_container());
    }

    #[test]
    fn contains_text_searches_descendants() {
        let tree = UIElement {
            children: vec![UIElement {
                children: vec![UIElement {
                    label: Some("Game Loop Complete".into()),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        };
        assert!(tree.contains_text("Game Loop Complete"));
        assert!(!tree.contains_text("Game Loop"));
    }
}
