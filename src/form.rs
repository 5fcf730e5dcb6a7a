// Copyright 2024 Mikael Lund
//
// Licensed under the Apache license, version 2.0 (the "license");
// you may not use this file except in compliance with the license.
// You may obtain a copy of the license at
//
//     http://www.apache.org/licenses/license-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the license is distributed on an "as is" basis,
// without warranties or conditions of any kind, either express or implied.
// See the license for the specific language governing permissions and
// limitations under the license.

//! Per type-pair interaction forms.
//!
//! Particle type `0` is reserved; real types are numbered `1..n_types`.

use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

/// Interaction form of an ordered type pair `(i, j)`.
///
/// The discriminants are ordered so that a contiguous range of forms
/// can be selected when packing neighbor lists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Form {
    SphereSphere = 0,
    SphereEllipse = 1,
    EllipseSphere = 2,
    EllipseEllipse = 3,
}

impl Form {
    /// Form of a pair from the shapes of the two participants
    pub const fn from_shapes(i_is_ellipsoid: bool, j_is_ellipsoid: bool) -> Self {
        match (i_is_ellipsoid, j_is_ellipsoid) {
            (true, true) => Form::EllipseEllipse,
            (true, false) => Form::EllipseSphere,
            (false, true) => Form::SphereEllipse,
            (false, false) => Form::SphereSphere,
        }
    }

    /// Pure ellipsoid-ellipsoid?
    pub const fn is_pure(self) -> bool {
        matches!(self, Form::EllipseEllipse)
    }
}

/// Immutable `n_types × n_types` grid of interaction forms
#[derive(Clone, Debug, PartialEq)]
pub struct FormMatrix {
    n_types: usize,
    forms: Vec<Form>,
    multiple_forms: bool,
}

impl FormMatrix {
    /// Build from a row-major grid
    pub fn new(n_types: usize, forms: Vec<Form>) -> Result<Self> {
        if forms.len() != n_types * n_types {
            return Err(EngineError::InvalidInput(format!(
                "form matrix has {} entries, expected {}",
                forms.len(),
                n_types * n_types
            )));
        }
        let multiple_forms = Self::scan(n_types, &forms);
        Ok(Self {
            n_types,
            forms,
            multiple_forms,
        })
    }

    /// Build from nested rows, e.g. `form_matrix[i][j]`
    pub fn from_rows(rows: &[Vec<Form>]) -> Result<Self> {
        let n_types = rows.len();
        if rows.iter().any(|row| row.len() != n_types) {
            return Err(EngineError::InvalidInput(
                "form matrix must be square".to_string(),
            ));
        }
        Self::new(n_types, rows.concat())
    }

    /// Derive all forms from per-type shapes; `is_ellipsoid[0]` is the reserved type.
    pub fn from_shapes(is_ellipsoid: &[bool]) -> Self {
        let n_types = is_ellipsoid.len();
        let forms = is_ellipsoid
            .iter()
            .flat_map(|&i| is_ellipsoid.iter().map(move |&j| Form::from_shapes(i, j)))
            .collect::<Vec<_>>();
        let multiple_forms = Self::scan(n_types, &forms);
        Self {
            n_types,
            forms,
            multiple_forms,
        }
    }

    /// Every pair is ellipsoid-ellipsoid
    pub fn uniform(n_types: usize) -> Self {
        Self::from_shapes(&vec![true; n_types])
    }

    // Upper triangle of the real types only; the reserved type 0 never counts.
    fn scan(n_types: usize, forms: &[Form]) -> bool {
        (1..n_types).any(|i| (i..n_types).any(|j| !forms[i * n_types + j].is_pure()))
    }

    pub fn n_types(&self) -> usize {
        self.n_types
    }

    /// Form of the pair `(i, j)`
    pub fn get(&self, i: usize, j: usize) -> Form {
        self.forms[i * self.n_types + j]
    }

    /// Is the self-interaction of type `i` pure ellipsoid-ellipsoid?
    pub fn is_pure_type(&self, i: usize) -> bool {
        self.get(i, i).is_pure()
    }

    /// True if at least one pair of real types is not ellipsoid-ellipsoid.
    /// Fixed at construction.
    pub fn multiple_forms(&self) -> bool {
        self.multiple_forms
    }

    /// Row-major view, e.g. for upload to the device
    pub fn as_slice(&self) -> &[Form] {
        &self.forms
    }
}
