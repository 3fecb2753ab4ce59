//! Anchor/Prior generation for Single Shot MultiBox Detectors (SSDs).
//!
//! Note that the implementation in this module is extremely limited and is
//! only meant to work for the palm detection model family, not more general
//! networks.

use std::ops::Index;

/// An anchor of an SSD network.
#[derive(Debug, Clone, Copy)]
pub struct Anchor {
    // values range from 0 to 1
    x_center: f32,
    y_center: f32,
}

impl Anchor {
    pub fn x_center(&self) -> f32 {
        self.x_center
    }

    pub fn y_center(&self) -> f32 {
        self.y_center
    }

    /// Returns the anchor's reference position as an `[x, y]` pair, the form
    /// the aggregation shader consumes.
    pub fn position(&self) -> [f32; 2] {
        [self.x_center, self.y_center]
    }
}

/// Describes an output layer of an SSD network.
pub struct LayerInfo {
    /// Number of anchors per feature map cell/pixel. Must be non-zero.
    boxes_per_cell: u32,
    /// Feature map size of this layer, in output cells.
    width: u32,
    height: u32,
}

impl LayerInfo {
    /// Creates a new SSD layer description.
    ///
    /// # Parameters
    ///
    /// - `boxes_per_cell`: the number of boxes associated with each cell in
    ///   this feature map.
    /// - `width`/`height`: size of this layer's feature map, in output cells.
    pub fn new(boxes_per_cell: u32, width: u32, height: u32) -> Self {
        assert_ne!(boxes_per_cell, 0);
        Self {
            boxes_per_cell,
            width,
            height,
        }
    }
}

/// The full set of anchors of an SSD network, in the network's anchor order.
pub struct Anchors {
    anchors: Vec<Anchor>,
}

impl Anchors {
    pub fn calculate(layers: &[LayerInfo]) -> Self {
        let mut anchors = Vec::new();

        for layer in layers {
            for y in 0..layer.height {
                for x in 0..layer.width {
                    for _ in 0..layer.boxes_per_cell {
                        let x_center = (x as f32 + 0.5) / layer.width as f32;
                        let y_center = (y as f32 + 0.5) / layer.height as f32;

                        anchors.push(Anchor { x_center, y_center });
                    }
                }
            }
        }

        Self { anchors }
    }

    /// Computes the anchor set of a palm detection network with a square
    /// input of `size` pixels.
    ///
    /// The model family uses two output layers: a stride-8 feature map with 2
    /// anchors per cell, and a stride-16 map with 6. For the reference
    /// 128-pixel network this yields the expected 896 anchors.
    pub fn for_input_size(size: u32) -> Self {
        Self::calculate(&[
            LayerInfo::new(2, size / 8, size / 8),
            LayerInfo::new(6, size / 16, size / 16),
        ])
    }

    /// Returns the total number of SSD anchors/priors.
    pub fn anchor_count(&self) -> usize {
        self.anchors.len()
    }

    /// Returns the anchor positions as a flat list of `[x, y]` pairs, ready
    /// for upload into a GPU storage buffer.
    pub fn to_raw(&self) -> Vec<[f32; 2]> {
        self.anchors.iter().map(|a| a.position()).collect()
    }
}

impl Index<usize> for Anchors {
    type Output = Anchor;

    fn index(&self, index: usize) -> &Anchor {
        &self.anchors[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_palm_model_has_896_anchors() {
        let anchors = Anchors::for_input_size(128);
        assert_eq!(anchors.anchor_count(), 16 * 16 * 2 + 8 * 8 * 6);

        // First anchor sits in the middle of the top-left stride-8 cell.
        assert_eq!(anchors[0].position(), [0.5 / 16.0, 0.5 / 16.0]);
        // Cells emit their anchors consecutively.
        assert_eq!(anchors[1].position(), [0.5 / 16.0, 0.5 / 16.0]);
        assert_eq!(anchors[2].position(), [1.5 / 16.0, 0.5 / 16.0]);
    }

    #[test]
    fn larger_input_sizes_scale_the_grid() {
        assert_eq!(
            Anchors::for_input_size(192).anchor_count(),
            24 * 24 * 2 + 12 * 12 * 6
        );
    }
}
