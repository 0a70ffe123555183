// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Constants and configuration shared between the lifecycle API and the
//! crash-time collector.

pub(crate) mod configuration;
pub(crate) mod constants;
