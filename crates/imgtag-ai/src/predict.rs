//! Single-sample inference against a trained model.

use std::sync::Arc;

use imgtag_core::Prediction;
use tracing::debug;

use crate::AiError;
use crate::extractor::FeatureExtractor;
use crate::model::Model;

/// Runs the extractor and the model head. Never touches the manifest.
#[derive(Clone)]
pub struct PredictionEngine {
    extractor: Arc<dyn FeatureExtractor>,
}

impl PredictionEngine {
    pub fn new(extractor: Arc<dyn FeatureExtractor>) -> Self {
        Self { extractor }
    }

    pub fn extractor(&self) -> &Arc<dyn FeatureExtractor> {
        &self.extractor
    }

    /// Classify raw image bytes. Scores cover exactly the model vocabulary.
    pub fn classify(
        &self,
        model: &Model,
        sample_path: &str,
        bytes: &[u8],
    ) -> Result<Prediction, AiError> {
        model.validate()?;
        if model.extractor_id != self.extractor.id() {
            return Err(AiError::ExtractorMismatch {
                model: model.extractor_id.clone(),
                engine: self.extractor.id().to_string(),
            });
        }
        let features = self.extractor.extract(bytes)?;
        let prediction = Prediction::from_scores(sample_path, model.scores(&features)?);
        debug!(
            path = %sample_path,
            label = %prediction.predicted_label,
            score = prediction.confidence,
            "classified"
        );
        Ok(prediction)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SoftmaxClassifier;
    use crate::extractor::PixelPoolExtractor;
    use crate::preprocess::Normalization;
    use crate::preprocess::tests::solid_png;
    use crate::vocabulary::Vocabulary;

    fn model_for(extractor: &dyn FeatureExtractor) -> Model {
        let dim = extractor.dim();
        // Class 0 ("blue") keys on the blue channel of the first cell,
        // class 1 ("red") on the red channel.
        let mut weights = vec![0.0; 2 * dim];
        weights[2] = 4.0;
        weights[dim] = 4.0;
        Model::new(
            extractor.id(),
            Vocabulary::from_labels(["red", "blue"]),
            SoftmaxClassifier {
                dim,
                classes: 2,
                weights,
                bias: vec![0.0; 2],
            },
            2,
        )
    }

    #[test]
    fn classify_uses_model_vocabulary() {
        let ex = Arc::new(PixelPoolExtractor::default());
        let model = model_for(ex.as_ref());
        let engine = PredictionEngine::new(ex);

        let p = engine
            .classify(&model, "r.png", &solid_png(8, 8, [255, 0, 0]))
            .unwrap();
        assert_eq!(p.predicted_label, "red");
        assert_eq!(p.sample_path, "r.png");
        let labels: Vec<&str> = p.scores.iter().map(|(l, _)| l.as_str()).collect();
        assert_eq!(labels, vec!["blue", "red"]);

        let p = engine
            .classify(&model, "b.png", &solid_png(8, 8, [0, 0, 255]))
            .unwrap();
        assert_eq!(p.predicted_label, "blue");
    }

    #[test]
    fn rejects_other_extractor() {
        let model = model_for(&PixelPoolExtractor::new(4));
        let engine = PredictionEngine::new(Arc::new(PixelPoolExtractor::default()));
        let err = engine
            .classify(&model, "x.png", &solid_png(4, 4, [1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, AiError::ExtractorMismatch { .. }));
    }

    #[test]
    fn rejects_same_grid_with_other_normalization() {
        let trained_with = PixelPoolExtractor::default().with_normalization(Normalization {
            offset: 0.0,
            scale: 1.0 / 255.0,
        });
        let model = model_for(&trained_with);
        let engine = PredictionEngine::new(Arc::new(PixelPoolExtractor::default()));
        let err = engine
            .classify(&model, "x.png", &solid_png(4, 4, [1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, AiError::ExtractorMismatch { .. }));
    }

    #[test]
    fn rejects_malformed_model() {
        let ex = Arc::new(PixelPoolExtractor::default());
        let mut model = model_for(ex.as_ref());
        model.classifier.bias.pop();
        let engine = PredictionEngine::new(ex);
        let err = engine
            .classify(&model, "x.png", &solid_png(4, 4, [1, 2, 3]))
            .unwrap_err();
        assert!(matches!(err, AiError::UnknownVocabulary(_)));
    }

    #[test]
    fn invalid_bytes() {
        let ex = Arc::new(PixelPoolExtractor::default());
        let model = model_for(ex.as_ref());
        let engine = PredictionEngine::new(ex);
        let err = engine.classify(&model, "x.png", b"nope").unwrap_err();
        assert!(matches!(err, AiError::InvalidImage { .. }));
    }
}
