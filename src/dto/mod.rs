pub mod webhook_dto;
