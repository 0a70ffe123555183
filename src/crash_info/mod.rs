// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod symbol_table;

pub use symbol_table::{Symbol, SymbolTable};
