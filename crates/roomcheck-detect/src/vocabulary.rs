//! Closed, versioned label sets the detector scores images against.

use std::str::FromStr;

use roomcheck_core::types::ObjectCategory;

use ObjectCategory::{Appliance, Decoration, Furniture, Other, SafetyHazard, Substance};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelVocabulary {
    #[default]
    ResidenceHallV1,
}

const RESIDENCE_HALL_V1: &[(&str, ObjectCategory)] = &[
    // prohibited items and hazards first; ties keep this order
    ("candle", SafetyHazard),
    ("lit candle", SafetyHazard),
    ("incense stick", SafetyHazard),
    ("open flame", SafetyHazard),
    ("vape", SafetyHazard),
    ("e-cigarette", SafetyHazard),
    ("cigarette", SafetyHazard),
    ("covered smoke detector", SafetyHazard),
    ("extension cord", SafetyHazard),
    ("power strip", SafetyHazard),
    ("overloaded outlet", SafetyHazard),
    ("blocked exit", SafetyHazard),
    ("knife", SafetyHazard),
    ("gun", SafetyHazard),
    ("sword", SafetyHazard),
    ("alcohol bottle", Substance),
    ("beer bottle", Substance),
    ("wine bottle", Substance),
    ("liquor bottle", Substance),
    ("beer can", Substance),
    ("drug paraphernalia", Substance),
    ("bong", Substance),
    ("microwave", Appliance),
    ("toaster", Appliance),
    ("toaster oven", Appliance),
    ("hot plate", Appliance),
    ("space heater", Appliance),
    ("mini fridge", Appliance),
    ("coffee maker", Appliance),
    ("electric kettle", Appliance),
    ("rice cooker", Appliance),
    ("air fryer", Appliance),
    ("air conditioner", Appliance),
    ("dog", Other),
    ("cat", Other),
    ("bird", Other),
    ("hamster", Other),
    ("fish tank", Other),
    ("bed", Furniture),
    ("bunk bed", Furniture),
    ("loft bed", Furniture),
    ("desk", Furniture),
    ("chair", Furniture),
    ("dresser", Furniture),
    ("bookshelf", Furniture),
    ("sofa", Furniture),
    ("nightstand", Furniture),
    ("wardrobe", Furniture),
    ("lamp", Furniture),
    ("poster", Decoration),
    ("string lights", Decoration),
    ("tapestry", Decoration),
    ("plant", Decoration),
    ("picture frame", Decoration),
    ("rug", Decoration),
    ("curtain", Decoration),
    ("mirror", Decoration),
    ("laptop", Other),
    ("television", Other),
    ("book", Other),
    ("backpack", Other),
    ("clothing", Other),
    ("water bottle", Other),
    ("trash bin", Other),
];

impl LabelVocabulary {
    pub fn version(&self) -> &'static str {
        match self {
            Self::ResidenceHallV1 => "residence-hall-v1",
        }
    }

    pub fn entries(&self) -> &'static [(&'static str, ObjectCategory)] {
        match self {
            Self::ResidenceHallV1 => RESIDENCE_HALL_V1,
        }
    }

    /// Text prompts scored against the image, one per entry.
    pub fn prompts(&self) -> Vec<String> {
        self.entries().iter().map(|(label, _)| format!("a photo of a {label}")).collect()
    }

    pub fn len(&self) -> usize { self.entries().len() }

    pub fn is_empty(&self) -> bool { self.entries().is_empty() }
}

impl FromStr for LabelVocabulary {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "residence-hall-v1" => Ok(Self::ResidenceHallV1),
            other => Err(format!("unknown label vocabulary '{other}'")),
        }
    }
}
