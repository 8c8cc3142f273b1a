// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::ops::{BitAnd, BitOr, Not};

/// Three-valued logic over the classical lattice False < Undecided < True:
/// negation mirrors the lattice, conjunction is the minimum, disjunction the
/// maximum. Undecided marks an answer that more information could still tip
/// either way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FuzzyValue {
    False,
    Undecided,
    True,
}

impl FuzzyValue {
    pub fn is_false(self) -> bool {
        self == FuzzyValue::False
    }

    pub fn is_undecided(self) -> bool {
        self == FuzzyValue::Undecided
    }

    pub fn is_true(self) -> bool {
        self == FuzzyValue::True
    }

    /// Lifts a plain boolean into the lattice.
    pub fn from_bool(value: bool) -> Self {
        if value {
            FuzzyValue::True
        } else {
            FuzzyValue::False
        }
    }
}

impl Display for FuzzyValue {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            FuzzyValue::False => write!(f, "false"),
            FuzzyValue::Undecided => write!(f, "undecided"),
            FuzzyValue::True => write!(f, "true"),
        }
    }
}

impl Not for FuzzyValue {
    type Output = FuzzyValue;

    fn not(self) -> FuzzyValue {
        match self {
            FuzzyValue::False => FuzzyValue::True,
            FuzzyValue::Undecided => FuzzyValue::Undecided,
            FuzzyValue::True => FuzzyValue::False,
        }
    }
}

impl BitAnd for FuzzyValue {
    type Output = FuzzyValue;

    fn bitand(self, other: FuzzyValue) -> FuzzyValue {
        self.min(other)
    }
}

impl BitOr for FuzzyValue {
    type Output = FuzzyValue;

    fn bitor(self, other: FuzzyValue) -> FuzzyValue {
        self.max(other)
    }
}

#[cfg(test)]
mod tests {
    use super::FuzzyValue::{False, True, Undecided};

    #[test]
    fn negation_mirrors_the_lattice() {
        assert_eq!(!True, False);
        assert_eq!(!False, True);
        assert_eq!(!Undecided, Undecided);
        assert_eq!(!!Undecided, Undecided);
    }

    #[test]
    fn conjunction_is_the_minimum() {
        assert_eq!(True & True, True);
        assert_eq!(True & Undecided, Undecided);
        assert_eq!(True & False, False);
        assert_eq!(Undecided & Undecided, Undecided);
        assert_eq!(Undecided & False, False);
        assert_eq!(False & False, False);
    }

    #[test]
    fn disjunction_is_the_maximum() {
        assert_eq!(False | False, False);
        assert_eq!(False | Undecided, Undecided);
        assert_eq!(False | True, True);
        assert_eq!(Undecided | Undecided, Undecided);
        assert_eq!(Undecided | True, True);
        assert_eq!(True | True, True);
    }

    #[test]
    fn de_morgan_holds_on_the_lattice() {
        for a in [False, Undecided, True] {
            for b in [False, Undecided, True] {
                assert_eq!(!(a & b), !a | !b);
                assert_eq!(!(a | b), !a & !b);
            }
        }
    }
}
