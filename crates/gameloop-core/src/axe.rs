//! Simulator accessibility access through the `axe` tool.
//!
//! `axe describe-ui` dumps the simulator's accessibility tree, which includes
//! the SpringBoard alert layer that hosts system permission dialogs.
//! [`AxeDialogSurface`] exposes only the buttons inside those alerts to the
//! dialog suppressor.

use std::process::Command;

use async_trait::async_trait;
use thiserror::Error;

use crate::element::UIElement;
use crate::suppressor::{DialogSurface, SuppressorError};

#[derive(Error, Debug)]
pub enum AxeError {
    #[error("Command execution failed: {0}")]
    CommandFailed(String),
    #[error("axe tool not found - install with: brew install cameroncooke/axe/axe")]
    NotInstalled,
    #[error("Element has no frame to tap")]
    NoFrame,
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct Axe;

impl Axe {
    /// Check if axe is installed
    pub fn is_installed() -> bool {
        which::which("axe").is_ok()
    }

    /// Dump UI hierarchy as JSON
    pub fn dump_hierarchy(udid: &str) -> Result<Vec<UIElement>, AxeError> {
        if !Self::is_installed() {
            return Err(AxeError::NotInstalled);
        }

        let output = Command::new("axe")
            .args(["describe-ui", "--udid", udid])
            .output()?;

        if !output.status.success() {
            return Err(AxeError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string()
            ));
        }

        let hierarchy: Vec<UIElement> = serde_json::from_slice(&output.stdout)?;
        Ok(hierarchy)
    }

    /// Tap at x,y coordinates
    pub fn tap(udid: &str, x: i32, y: i32) -> Result<(), AxeError> {
        if !Self::is_installed() {
            return Err(AxeError::NotInstalled);
        }

        let output = Command::new("axe")
            .args(["tap", "-x", &x.to_string(), "-y", &y.to_string(), "--udid", udid])
            .output()?;

        if !output.status.success() {
            return Err(AxeError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).to_string()
            ));
        }
        Ok(())
    }

    /// Tap the center of an element's frame
    pub fn tap_element(udid: &str, element: &UIElement) -> Result<(), AxeError> {
        let (x, y) = element.frame.as_ref().ok_or(AxeError::NoFrame)?.center();
        Self::tap(udid, x, y)
    }

    /// Buttons nested inside alert or sheet containers, in tree order
    pub fn alert_buttons(elements: &[UIElement]) -> Vec<UIElement> {
        let mut result = Vec::new();
        Self::collect_alert_buttons(elements, false, &mut result);
        result
    }

    fn collect_alert_buttons(elements: &[UIElement], inside_alert: bool, result: &mut Vec<UIElement>) {
        for element in elements {
            let inside = inside_alert || element.is_alert_container();
            if inside && element.is_button() {
                result.push(element.clone());
            }
            Self::collect_alert_buttons(&element.children, inside, result);
        }
    }

    /// Whether any element of the hierarchy shows `text`
    pub fn hierarchy_contains(elements: &[UIElement], text: &str) -> bool {
        elements.iter().any(|element| element.contains_text(text))
    }
}

/// Dialog surface of a simulator, read through `axe`.
#[derive(Debug, Clone)]
pub struct AxeDialogSurface {
    udid: String,
}

impl AxeDialogSurface {
    pub fn new(udid: impl Into<String>) -> Self {
        Self { udid: udid.into() }
    }
}

#[async_trait]
impl DialogSurface for AxeDialogSurface {
    async fn scan(&self) -> Result<Vec<UIElement>, SuppressorError> {
        let udid = self.udid.clone();
        let hierarchy = tokio::task::spawn_blocking(move || Axe::dump_hierarchy(&udid))
            .await
            .map_err(|e| SuppressorError::Scan(e.to_string()))?
            .map_err(|e| SuppressorError::Scan(e.to_string()))?;
        Ok(Axe::alert_buttons(&hierarchy))
    }

    async fn activate(&self, element: &UIElement) -> Result<(), SuppressorError> {
        let udid = self.udid.clone();
        let element = element.clone();
        tokio::task::spawn_blocking(move || Axe::tap_element(&udid, &element))
            .await
            .map_err(|e| SuppressorError::Activate(e.to_string()))?
            .map_err(|e| SuppressorError::Activate(e.to_string()))
    }
}
