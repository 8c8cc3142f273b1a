// Copyright 2022 The Treeline Network.
//
// This Treeline Network Software is licensed to you under The General Public License (GPL),
// version 3. Unless required by applicable law or agreed to in writing, the Treeline Network
// Software distributed under the GPL Licence is distributed on an "AS IS" BASIS, WITHOUT
// WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied. Please review the Licences
// for the specific language governing permissions and limitations relating to use of the
// Treeline Network Software.

//! Distributed entity search: Boolean queries over the attribute space,
//! evaluated by the dominating-set peers without a central index.

mod dsn_handler;
mod expression;
mod fuzzy;
mod query;

pub use dsn_handler::DsnHandler;
pub use expression::{ComparisonOp, EvalContext, Expression, Operand};
pub use fuzzy::FuzzyValue;
pub use query::{FindQuery, FindQueryScope, MissingAttributes, Selection};

use crate::peer::NodeInfo;
use crate::store::Value;

/// Attributes reported per fulfilling peer.
pub type Attributes = Vec<(String, Value)>;

/// The answer shape of a find query.
pub type FindResult = Vec<(NodeInfo, Attributes)>;
