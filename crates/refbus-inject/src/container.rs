use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{InjectError, Result};

/// A constructed service instance, shared across the process.
pub type Shared = Arc<dyn Any + Send + Sync>;

type BuildFn =
    Box<dyn FnOnce(&ServiceMap) -> std::result::Result<Shared, Box<dyn std::error::Error + Send + Sync>>>;

/// Declares one service: its id, the ids it depends on (in parameter
/// order), and the closure that builds it.
///
/// This registration table is the container's entire input; dependency
/// metadata is plain data declared at service-definition time, not
/// discovered by reflection.
pub struct Descriptor {
    id: String,
    dependencies: Vec<String>,
    build: BuildFn,
}

impl Descriptor {
    /// Declare a service with no dependencies.
    pub fn new<T, F>(id: impl Into<String>, build: F) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce() -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>> + 'static,
    {
        let id = id.into();
        Self {
            id,
            dependencies: Vec::new(),
            build: Box::new(move |_map| build().map(|value| Arc::new(value) as Shared)),
        }
    }

    /// Declare a service whose build closure receives the map of
    /// already-built instances.
    ///
    /// `dependencies` lists the ids the closure will look up, in the order
    /// the original constructor takes them.
    pub fn with_dependencies<T, F>(
        id: impl Into<String>,
        dependencies: &[&str],
        build: F,
    ) -> Self
    where
        T: Any + Send + Sync,
        F: FnOnce(&ServiceMap) -> std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>
            + 'static,
    {
        Self {
            id: id.into(),
            dependencies: dependencies.iter().map(|d| d.to_string()).collect(),
            build: Box::new(move |map| build(map).map(|value| Arc::new(value) as Shared)),
        }
    }

    /// The service id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The declared dependency ids, in parameter order.
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

impl std::fmt::Debug for Descriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Descriptor")
            .field("id", &self.id)
            .field("dependencies", &self.dependencies)
            .finish()
    }
}

/// The finished id → instance map, in construction order.
///
/// Handed to the RPC layer for exposure once construction completes; also
/// the lookup context passed to each build closure.
pub struct ServiceMap {
    instances: HashMap<String, Shared>,
    order: Vec<String>,
}

impl ServiceMap {
    fn empty() -> Self {
        Self {
            instances: HashMap::new(),
            order: Vec::new(),
        }
    }

    /// Look up a service and downcast it to its concrete type.
    pub fn get<T: Any + Send + Sync>(&self, id: &str) -> Result<Arc<T>> {
        let raw = self.instances.get(id).ok_or_else(|| InjectError::MissingInstance {
            id: id.to_string(),
            required_by: "lookup".to_string(),
        })?;
        Arc::clone(raw)
            .downcast::<T>()
            .map_err(|_| InjectError::TypeMismatch {
                id: id.to_string(),
                expected: std::any::type_name::<T>(),
            })
    }

    /// Look up a service without downcasting.
    pub fn get_raw(&self, id: &str) -> Option<Shared> {
        self.instances.get(id).cloned()
    }

    /// Whether a service id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// The resolved construction order.
    pub fn build_order(&self) -> &[String] {
        &self.order
    }

    /// Number of constructed services.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl std::fmt::Debug for ServiceMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceMap")
            .field("order", &self.order)
            .finish()
    }
}

/// Build the full service graph.
///
/// Validation happens before any instantiation: duplicate ids, dependencies
/// on unregistered ids, and cycles all fail the whole registration with
/// nothing constructed. Instantiation then proceeds in topological order
/// (stable with respect to registration order), each build closure receiving
/// the already-built instances.
pub fn register_all(descriptors: Vec<Descriptor>) -> Result<ServiceMap> {
    // Duplicate and missing-id checks first; both are cheaper than cycle
    // detection and produce more precise errors.
    let mut index: HashMap<&str, usize> = HashMap::with_capacity(descriptors.len());
    for (position, descriptor) in descriptors.iter().enumerate() {
        if index.insert(descriptor.id.as_str(), position).is_some() {
            return Err(InjectError::DuplicateId {
                id: descriptor.id.clone(),
            });
        }
    }
    for descriptor in &descriptors {
        for dependency in &descriptor.dependencies {
            if !index.contains_key(dependency.as_str()) {
                return Err(InjectError::MissingInstance {
                    id: dependency.clone(),
                    required_by: descriptor.id.clone(),
                });
            }
        }
    }

    let order = topological_order(&descriptors, &index)?;
    debug!(order = ?order.iter().map(|&i| descriptors[i].id.as_str()).collect::<Vec<_>>(),
           "resolved service build order");

    let mut map = ServiceMap::empty();
    let mut builds: Vec<Option<Descriptor>> = descriptors.into_iter().map(Some).collect();
    for position in order {
        let descriptor = builds[position]
            .take()
            .unwrap_or_else(|| unreachable!("each position appears once in the order"));
        let id = descriptor.id;
        let instance = (descriptor.build)(&map).map_err(|err| InjectError::Construction {
            id: id.clone(),
            message: err.to_string(),
        })?;
        debug!(service = %id, "constructed service");
        map.instances.insert(id.clone(), instance);
        map.order.push(id);
    }
    Ok(map)
}

/// Kahn's algorithm over descriptor positions.
///
/// Ready nodes are taken in registration order, which keeps the output
/// stable for graphs with independent services. Any leftover node is part
/// of a cycle; the first one in registration order is reported.
fn topological_order(
    descriptors: &[Descriptor],
    index: &HashMap<&str, usize>,
) -> Result<Vec<usize>> {
    let count = descriptors.len();
    let mut in_degree = vec![0usize; count];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];

    for (position, descriptor) in descriptors.iter().enumerate() {
        for dependency in &descriptor.dependencies {
            let dep_position = index[dependency.as_str()];
            in_degree[position] += 1;
            dependents[dep_position].push(position);
        }
    }

    let mut order = Vec::with_capacity(count);
    let mut ready: Vec<usize> = (0..count).filter(|&i| in_degree[i] == 0).collect();

    while let Some(&position) = ready.first() {
        ready.remove(0);
        order.push(position);
        for &dependent in &dependents[position] {
            in_degree[dependent] -= 1;
            if in_degree[dependent] == 0 {
                // Insert keeping ready sorted by registration order.
                let at = ready
                    .iter()
                    .position(|&r| r > dependent)
                    .unwrap_or(ready.len());
                ready.insert(at, dependent);
            }
        }
    }

    if order.len() < count {
        let offender = (0..count)
            .find(|&i| in_degree[i] > 0)
            .unwrap_or_else(|| unreachable!("a short order implies a positive in-degree"));
        return Err(InjectError::CyclicDependency {
            id: descriptors[offender].id.clone(),
        });
    }
    Ok(order)
}
