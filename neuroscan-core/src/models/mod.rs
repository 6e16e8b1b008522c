pub mod analysis;
pub mod scan;

pub use analysis::{
    Analysis, AnalysisShapeError, Coordinates, DifferentialDiagnosis, GrayMatter, Severity,
    TumorDetection, TumorType,
};
pub use scan::{content_type_for, ScanImage, ScanRecord, ScanTags};
