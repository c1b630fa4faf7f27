use std::collections::HashMap;

use anyhow::Result;
use rand::Rng;
use tracing::debug;

use crate::errors::AgentError;
use crate::gateway::{BrowserGateway, RawElement};
use crate::types::{BBox, Region, RegionRole, LABEL_MAX_CHARS, MIN_REGION_DIM};

/// Live handle kept for one region between scans.
#[derive(Debug, Clone)]
pub struct StoredElement {
    /// Engine-level address (stamped-attribute selector).
    pub handle: String,
    pub role: RegionRole,
    pub label: String,
}

/// Region id → live handle, replaced atomically on every scan. Lookups
/// against ids from an earlier scan fail with [`AgentError::StaleElement`].
pub type ElementStore = HashMap<String, StoredElement>;

/// Rebuilds the interactive-element catalogue on every scan and owns the
/// handle store the dispatch path resolves against.
#[derive(Default)]
pub struct Catalogue {
    store: ElementStore,
    scan_serial: u64,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// One pass over the DOM: scan, filter, label, assign fresh opaque
    /// ids. The previous store is discarded before the new one is built.
    pub fn detect_regions(&mut self, gateway: &dyn BrowserGateway) -> Result<Vec<Region>> {
        self.store.clear();
        self.scan_serial += 1;

        let raws = gateway.scan(&format!("s{}", self.scan_serial))?;
        let mut regions = Vec::with_capacity(raws.len());

        for raw in raws {
            let Some((region, stored)) = catalogue_element(&raw, &self.store) else {
                continue;
            };
            self.store.insert(region.id.clone(), stored);
            regions.push(region);
        }

        debug!(
            scan = self.scan_serial,
            regions = regions.len(),
            "catalogue rebuilt"
        );
        Ok(regions)
    }

    /// Resolve a region id against the current scan.
    pub fn resolve(&self, id: &str) -> Result<&StoredElement, AgentError> {
        self.store
            .get(id)
            .ok_or_else(|| AgentError::StaleElement(id.to_string()))
    }

    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

/// Apply the cataloguing rules to one raw element. Pure so the filter and
/// label pipeline are testable without a browser.
fn catalogue_element(
    raw: &RawElement,
    store: &ElementStore,
) -> Option<(Region, StoredElement)> {
    if !raw.visible || !bbox_large_enough(&raw.bbox) {
        return None;
    }

    let (label, confidence) = derive_label(raw)?;
    let role = infer_role(raw);

    let mut id = fresh_id();
    // Collisions on 8 hex chars are unlikely but ids must be unique.
    while store.contains_key(&id) {
        id = fresh_id();
    }

    let region = Region {
        id: id.clone(),
        label: label.clone(),
        role,
        bbox: raw.bbox,
        href: raw.href.clone(),
        confidence,
    };
    let stored = StoredElement {
        handle: raw.handle.clone(),
        role,
        label,
    };
    Some((region, stored))
}

fn bbox_large_enough(bbox: &BBox) -> bool {
    bbox.w >= MIN_REGION_DIM && bbox.h >= MIN_REGION_DIM
}

fn fresh_id() -> String {
    format!("element-{:08x}", rand::thread_rng().gen::<u32>())
}

/// First non-empty of aria-label, name, placeholder, text content; then a
/// descendant image's alt. Elements that stay unlabeled are dropped.
/// Returns the label and a confidence grade for how it was derived.
fn derive_label(raw: &RawElement) -> Option<(String, f64)> {
    let candidates = [
        (raw.aria_label.as_deref(), 0.95),
        (raw.name.as_deref(), 0.9),
        (raw.placeholder.as_deref(), 0.85),
        (raw.text.as_deref(), 0.75),
    ];
    for (candidate, confidence) in candidates {
        if let Some(label) = candidate.map(normalize).filter(|l| !l.is_empty()) {
            return Some((truncate(&label), confidence));
        }
    }

    if let Some(alt) = raw.image_alt.as_deref() {
        let alt = normalize(alt);
        let label = if alt.is_empty() {
            "Unlabeled Image".to_string()
        } else {
            format!("Image: {alt}")
        };
        return Some((truncate(&label), 0.5));
    }

    None
}

fn normalize(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(s: &str) -> String {
    s.chars().take(LABEL_MAX_CHARS).collect()
}

fn infer_role(raw: &RawElement) -> RegionRole {
    if let Some(role) = raw.role_attr.as_deref() {
        match role {
            "button" => return RegionRole::Button,
            "link" => return RegionRole::Link,
            "checkbox" => return RegionRole::Checkbox,
            "radio" => return RegionRole::Radio,
            "textbox" | "searchbox" => return RegionRole::Textbox,
            _ => {}
        }
    }

    match raw.tag.as_str() {
        "a" => RegionRole::Link,
        "button" => RegionRole::Button,
        "textarea" => RegionRole::Textarea,
        "select" => RegionRole::Select,
        "input" => match raw.input_type.as_deref() {
            Some("checkbox") => RegionRole::Checkbox,
            Some("radio") => RegionRole::Radio,
            Some("button" | "submit" | "reset" | "image") => RegionRole::Button,
            _ => RegionRole::Textbox,
        },
        _ => RegionRole::Other,
    }
}
