use std::collections::HashMap;

use crate::error::{ManagerError, ModelError};
use super::conversion::{ConversionSpec, InputConversion};
use super::models::{LeastSquaresModel, Model, SgdModel};

pub type ModelLoader = fn(&[u8]) -> Result<Box<dyn Model>, ModelError>;
pub type ConversionFactory = fn() -> Box<dyn InputConversion>;

/// Maps persisted identifiers back to model loaders and custom conversion strategies.
pub struct Registry {
    models: HashMap<String, ModelLoader>,
    conversions: HashMap<String, ConversionFactory>,
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self {
            models: HashMap::new(),
            conversions: HashMap::new(),
        };
        registry.register_model(LeastSquaresModel::KIND, load_least_squares);
        registry.register_model(SgdModel::KIND, load_sgd);
        registry
    }
}

fn load_least_squares(bytes: &[u8]) -> Result<Box<dyn Model>, ModelError> {
    Ok(Box::new(LeastSquaresModel::from_native(bytes)?))
}

fn load_sgd(bytes: &[u8]) -> Result<Box<dyn Model>, ModelError> {
    Ok(Box::new(SgdModel::from_native(bytes)?))
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_model(&mut self, kind: &str, loader: ModelLoader) {
        self.models.insert(kind.to_string(), loader);
    }

    pub fn register_conversion(&mut self, name: &str, factory: ConversionFactory) {
        self.conversions.insert(name.to_string(), factory);
    }

    pub fn load_model(&self, kind: &str, bytes: &[u8]) -> Result<Box<dyn Model>, ManagerError> {
        let loader = self
            .models
            .get(kind)
            .ok_or_else(|| ManagerError::UnknownModelKind(kind.to_string()))?;
        Ok(loader(bytes)?)
    }

    pub fn conversion(&self, spec: &ConversionSpec) -> Result<Box<dyn InputConversion>, ManagerError> {
        match spec {
            ConversionSpec::Custom { name } => self
                .conversions
                .get(name)
                .map(|factory| factory())
                .ok_or_else(|| ManagerError::UnknownConversion(name.clone())),
            builtin => builtin
                .builtin()
                .ok_or_else(|| ManagerError::UnknownConversion(format!("{:?}", builtin))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::AllButLast;

    struct Reversed;

    impl InputConversion for Reversed {
        fn name(&self) -> &str {
            "reversed"
        }

        fn spec(&self) -> ConversionSpec {
            ConversionSpec::Custom {
                name: self.name().to_string(),
            }
        }

        fn convert(
            &self,
            table: &crate::data::Table,
        ) -> Result<(nalgebra::DMatrix<f64>, nalgebra::DVector<f64>), crate::error::TableError> {
            let (x, y) = AllButLast.convert(table)?;
            Ok((x.map(|v| -v), y))
        }
    }

    fn reversed() -> Box<dyn InputConversion> {
        Box::new(Reversed)
    }

    #[test]
    fn custom_conversions_need_registration() {
        let spec = Reversed.spec();
        let mut registry = Registry::new();
        assert!(matches!(registry.conversion(&spec), Err(ManagerError::UnknownConversion(_))));

        registry.register_conversion("reversed", reversed);
        assert_eq!(registry.conversion(&spec).unwrap().name(), "reversed");
    }

    #[test]
    fn unknown_model_kind_is_reported() {
        assert!(matches!(
            Registry::default().load_model("transformer", b"{}"),
            Err(ManagerError::UnknownModelKind(_))
        ));
        assert!(matches!(
            Registry::default().load_model(SgdModel::KIND, b"not json"),
            Err(ManagerError::Model(ModelError::Serialization(_)))
        ));
    }
}
