//! External, lazily materialized data sources.
//!
//! A node whose result carries a [`DataSourceHandle`] does not hold the data
//! itself; consumers materialize it through the registry when they evaluate.

use crate::error::EvalError;
use crate::result::DataSourceHandle;
use crate::value::Value;
use std::cell::RefCell;
use std::rc::Rc;

pub trait DataSourceProvider {
    fn name(&self) -> &str {
        "external"
    }

    /// `Ok(None)` while the data is not available yet.
    fn materialize(&self) -> Result<Option<Vec<Value>>, String>;
}

/// In-memory source whose content the host replaces at will.
#[derive(Clone, Default)]
pub struct SharedData {
    name: String,
    content: Rc<RefCell<Option<Vec<Value>>>>,
}

impl SharedData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Rc::default(),
        }
    }

    pub fn with_values(name: impl Into<String>, values: Vec<Value>) -> Self {
        let data = Self::new(name);
        data.set(values);
        data
    }

    pub fn set(&self, values: Vec<Value>) {
        *self.content.borrow_mut() = Some(values);
    }

    pub fn clear(&self) {
        *self.content.borrow_mut() = None;
    }
}

impl DataSourceProvider for SharedData {
    fn name(&self) -> &str {
        &self.name
    }

    fn materialize(&self) -> Result<Option<Vec<Value>>, String> {
        Ok(self.content.borrow().clone())
    }
}

#[derive(Default)]
pub struct DataSourceRegistry {
    providers: Vec<Box<dyn DataSourceProvider>>,
}

impl DataSourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Box<dyn DataSourceProvider>) -> DataSourceHandle {
        let handle = DataSourceHandle(self.providers.len() as u32);
        self.providers.push(provider);
        handle
    }

    pub fn name(&self, handle: DataSourceHandle) -> Option<&str> {
        self.providers.get(handle.0 as usize).map(|p| p.name())
    }

    pub fn materialize(&self, handle: DataSourceHandle) -> Result<Option<Vec<Value>>, EvalError> {
        let provider = self
            .providers
            .get(handle.0 as usize)
            .ok_or(EvalError::UnknownDataSource(handle.0))?;
        provider
            .materialize()
            .map_err(|e| EvalError::DataSource(handle.0, e))
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
