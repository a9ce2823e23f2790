//! Fetch planning: turning a [`FetchSpec`] into association loads.
//!
//! The planner merges the spec's paths into a tree (shared prefixes load
//! once) and walks it depth-first in declaration order. Each step loads one
//! association for every instance reached by the previous step and installs
//! the result as `Loaded`, so the instances stay usable after the session
//! closes.
//!
//! ```text
//! FetchSpec "graph.AuthorBooks" (root: author)
//!   books.publisher
//!   books.reviews
//!   awards
//!
//! Plan:
//!   books            (author)
//!   books.publisher  (every book)
//!   books.reviews    (every book)
//!   awards           (author)
//! ```

use persistkit_core::{
    AssociationLoader, AssociationValue, Cx, EntityRef, Error, FetchSpec, Outcome,
};

#[derive(Debug, Clone)]
struct FetchNode {
    association: String,
    children: Vec<FetchNode>,
}

impl FetchNode {
    fn new(association: &str) -> Self {
        Self {
            association: association.to_string(),
            children: Vec::new(),
        }
    }
}

fn insert_path(nodes: &mut Vec<FetchNode>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    let idx = match nodes.iter().position(|n| &n.association == first) {
        Some(idx) => idx,
        None => {
            nodes.push(FetchNode::new(first));
            nodes.len() - 1
        }
    };
    insert_path(&mut nodes[idx].children, rest);
}

/// Execution plan for one fetch spec.
#[derive(Debug, Clone)]
pub struct FetchPlanner {
    name: String,
    root_type: &'static str,
    roots: Vec<FetchNode>,
}

impl FetchPlanner {
    /// Build the plan for a spec.
    #[must_use]
    pub fn new(spec: &FetchSpec) -> Self {
        let mut roots = Vec::new();
        for path in spec.paths() {
            insert_path(&mut roots, path.segments());
        }
        Self {
            name: spec.name().to_string(),
            root_type: spec.root_type(),
            roots,
        }
    }

    /// Entity type the plan starts from.
    #[must_use]
    pub fn root_type(&self) -> &'static str {
        self.root_type
    }

    /// Dotted association paths in the order they will be loaded.
    #[must_use]
    pub fn steps(&self) -> Vec<String> {
        fn walk(nodes: &[FetchNode], prefix: &str, out: &mut Vec<String>) {
            for node in nodes {
                let path = if prefix.is_empty() {
                    node.association.clone()
                } else {
                    format!("{prefix}.{}", node.association)
                };
                out.push(path.clone());
                walk(&node.children, &path, out);
            }
        }

        let mut out = Vec::new();
        walk(&self.roots, "", &mut out);
        out
    }

    /// Check that the plan applies to entities of `entity_type`.
    pub fn validate_root(&self, entity_type: &'static str) -> persistkit_core::Result<()> {
        if self.root_type == entity_type {
            Ok(())
        } else {
            Err(Error::InvalidFetchSpec(format!(
                "fetch spec '{}' applies to {} but was used on {}",
                self.name, self.root_type, entity_type
            )))
        }
    }

    /// Execute the plan against already-materialized roots.
    ///
    /// Returns the number of associations installed. Associations that are
    /// already loaded are reused without touching the backend.
    #[tracing::instrument(level = "debug", skip(self, cx, loader, roots), fields(spec = %self.name))]
    pub async fn apply(
        &self,
        cx: &Cx,
        loader: &dyn AssociationLoader,
        roots: &[EntityRef],
    ) -> Outcome<usize, Error> {
        for root in roots {
            if let Err(e) = self.validate_root(root.entity_type()) {
                return Outcome::Err(e);
            }
        }

        let mut installed = 0usize;
        let mut work: Vec<(&FetchNode, Vec<EntityRef>)> = self
            .roots
            .iter()
            .rev()
            .map(|node| (node, roots.to_vec()))
            .collect();

        while let Some((node, owners)) = work.pop() {
            let mut reached: Vec<EntityRef> = Vec::new();
            for owner in &owners {
                let value = match load_into(cx, loader, owner, &node.association).await {
                    Outcome::Ok((value, loaded)) => {
                        installed += usize::from(loaded);
                        value
                    }
                    Outcome::Err(e) => return Outcome::Err(e),
                    Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                    Outcome::Panicked(p) => return Outcome::Panicked(p),
                };
                for target in value.iter() {
                    if !reached.iter().any(|seen| EntityRef::ptr_eq(seen, target)) {
                        reached.push(target.clone());
                    }
                }
            }
            tracing::trace!(
                association = %node.association,
                owners = owners.len(),
                reached = reached.len(),
                "Fetch step complete"
            );
            for child in node.children.iter().rev() {
                work.push((child, reached.clone()));
            }
        }

        tracing::debug!(installed, "Fetch plan applied");
        Outcome::Ok(installed)
    }
}

/// Load one association of one owner and install it as `Loaded`.
///
/// Returns the value and whether a backend load happened.
async fn load_into(
    cx: &Cx,
    loader: &dyn AssociationLoader,
    owner: &EntityRef,
    association: &str,
) -> Outcome<(AssociationValue, bool), Error> {
    {
        let entity = owner.read();
        match entity.association_info(association) {
            None => {
                return Outcome::Err(Error::UnknownAssociation {
                    entity_type: entity.entity_type(),
                    association: association.to_string(),
                });
            }
            Some(assoc) => {
                if let Some(value) = assoc.get() {
                    return Outcome::Ok((value.clone(), false));
                }
            }
        }
    }

    let value = match loader.load_association(cx, owner, association).await {
        Outcome::Ok(value) => value,
        Outcome::Err(e) => return Outcome::Err(e),
        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
        Outcome::Panicked(p) => return Outcome::Panicked(p),
    };

    let mut entity = owner.write();
    match entity.install(association, value.clone()) {
        Ok(()) => Outcome::Ok((value, true)),
        Err(e) => Outcome::Err(e),
    }
}
